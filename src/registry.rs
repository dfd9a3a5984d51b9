// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Registry
//!
//! Named connection profiles, each owning a connection factory and the
//! publish, admin and subscribe clients bound to it.
//!
//! Clients discovered elsewhere (for instance pre-wired by the host
//! application) are matched to profiles by [`ConnectionIdentity`], so a
//! profile reuses them instead of creating its own. Missing clients are
//! created from the factory on first use; every slot is a single-assignment
//! cell, so concurrent first lookups create at most one client per profile.

use crate::{
    client::{AdminClient, ConnectionFactory, ConnectionIdentity, PublishClient, SubscribeClient},
    errors::{root_cause_message, AmqpError},
};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

/// Profile name used when a single factory is registered without a name.
pub const DEFAULT_CONNECTION: &str = "DefaultConnection";

/// A named connection factory and its lazily created clients.
pub struct ConnectionProfile {
    name: String,
    factory: Arc<dyn ConnectionFactory>,
    publish: OnceCell<Arc<dyn PublishClient>>,
    admin: OnceCell<Arc<dyn AdminClient>>,
    subscribe: OnceCell<Arc<dyn SubscribeClient>>,
}

impl ConnectionProfile {
    fn new(name: &str, factory: Arc<dyn ConnectionFactory>) -> Self {
        ConnectionProfile {
            name: name.to_owned(),
            factory,
            publish: OnceCell::new(),
            admin: OnceCell::new(),
            subscribe: OnceCell::new(),
        }
    }

    /// The name endpoints select this profile by with the `connection` option.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Gets the identity of the broker this profile connects to.
    ///
    /// # Returns
    /// The factory's identity, used to match externally discovered clients
    pub fn identity(&self) -> ConnectionIdentity {
        self.factory.identity()
    }

    pub fn factory(&self) -> Arc<dyn ConnectionFactory> {
        self.factory.clone()
    }

    /// The profile's publish client, created from the factory on first use.
    pub async fn publish_client(&self) -> Result<Arc<dyn PublishClient>, AmqpError> {
        self.publish
            .get_or_try_init(|| async {
                info!(profile = %self.name, "creating publish client");
                self.factory.create_publish_client().await.map_err(|err| {
                    error!(error = err.to_string(), profile = %self.name, "failure to create publish client");
                    AmqpError::ConnectionError(root_cause_message(&err))
                })
            })
            .await
            .cloned()
    }

    /// The profile's admin client, created from the factory on first use.
    pub async fn admin_client(&self) -> Result<Arc<dyn AdminClient>, AmqpError> {
        self.admin
            .get_or_try_init(|| async {
                info!(profile = %self.name, "creating admin client");
                self.factory.create_admin_client().await.map_err(|err| {
                    error!(error = err.to_string(), profile = %self.name, "failure to create admin client");
                    AmqpError::ConnectionError(root_cause_message(&err))
                })
            })
            .await
            .cloned()
    }

    /// The profile's subscribe client, created from the factory on first use.
    pub async fn subscribe_client(&self) -> Result<Arc<dyn SubscribeClient>, AmqpError> {
        self.subscribe
            .get_or_try_init(|| async {
                debug!(profile = %self.name, "creating subscribe client");
                self.factory.create_subscribe_client().await.map_err(|err| {
                    error!(error = err.to_string(), profile = %self.name, "failure to create subscribe client");
                    AmqpError::ConnectionError(root_cause_message(&err))
                })
            })
            .await
            .cloned()
    }
}

/// Clients resolved for one profile.
#[derive(Clone)]
pub struct ResolvedConnection {
    pub factory: Arc<dyn ConnectionFactory>,
    pub publish: Arc<dyn PublishClient>,
    pub admin: Arc<dyn AdminClient>,
}

/// Ordered set of connection profiles. The first registered profile is the default.
#[derive(Default)]
pub struct ConnectionRegistry {
    profiles: Vec<Arc<ConnectionProfile>>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        ConnectionRegistry::default()
    }

    /// Creates a registry holding a single factory under [`DEFAULT_CONNECTION`].
    pub fn with_factory(factory: Arc<dyn ConnectionFactory>) -> Self {
        ConnectionRegistry {
            profiles: vec![Arc::new(ConnectionProfile::new(DEFAULT_CONNECTION, factory))],
        }
    }

    /// Registers a factory under `name`. Names are unique.
    pub fn register(
        &mut self,
        name: &str,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Result<(), AmqpError> {
        if self.profiles.iter().any(|p| p.name == name) {
            error!(profile = name, "connection profile registered twice");
            return Err(AmqpError::ConfigurationError(format!(
                "connection profile `{}` is already registered",
                name
            )));
        }

        info!(profile = name, identity = %factory.identity(), "registering connection factory");
        self.profiles.push(Arc::new(ConnectionProfile::new(name, factory)));
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Lists the registered profile names.
    ///
    /// # Returns
    /// The names in registration order, so the default profile comes first
    pub fn names(&self) -> Vec<&str> {
        self.profiles.iter().map(|p| p.name.as_str()).collect()
    }

    /// Hands externally created publish clients to the profiles with the same
    /// identity. Returns how many were adopted.
    pub fn discover_publish_clients(&self, clients: Vec<Arc<dyn PublishClient>>) -> usize {
        let mut adopted = 0;
        for client in clients {
            let identity = client.identity();
            let Some(profile) = self.profiles.iter().find(|p| p.identity() == identity) else {
                warn!(identity = %identity, "no connection profile matches publish client");
                continue;
            };

            if profile.publish.set(client).is_ok() {
                info!(profile = %profile.name, identity = %identity, "found publish client");
                adopted += 1;
            } else {
                debug!(profile = %profile.name, "publish client already set, ignoring discovered one");
            }
        }
        adopted
    }

    /// Hands externally created admin clients to the profiles with the same
    /// identity. Returns how many were adopted.
    pub fn discover_admin_clients(&self, clients: Vec<Arc<dyn AdminClient>>) -> usize {
        let mut adopted = 0;
        for client in clients {
            let identity = client.identity();
            let Some(profile) = self.profiles.iter().find(|p| p.identity() == identity) else {
                warn!(identity = %identity, "no connection profile matches admin client");
                continue;
            };

            if profile.admin.set(client).is_ok() {
                info!(profile = %profile.name, identity = %identity, "found admin client");
                adopted += 1;
            } else {
                debug!(profile = %profile.name, "admin client already set, ignoring discovered one");
            }
        }
        adopted
    }

    /// Looks up a profile by name, or the default profile when `name` is `None`.
    pub fn profile(&self, name: Option<&str>) -> Result<Arc<ConnectionProfile>, AmqpError> {
        let found = match name {
            Some(name) => self.profiles.iter().find(|p| p.name == name),
            None => self.profiles.first(),
        };

        match found {
            Some(profile) => Ok(profile.clone()),
            None if self.profiles.is_empty() => {
                error!("cannot find a connection factory");
                Err(AmqpError::ConfigurationError(
                    "no connection factory is registered".to_owned(),
                ))
            }
            None => {
                error!(profile = ?name, "unknown connection profile");
                Err(AmqpError::ConfigurationError(format!(
                    "unknown connection profile `{}`",
                    name.unwrap_or_default()
                )))
            }
        }
    }

    /// Resolves the factory, publish client and admin client of a profile.
    pub async fn resolve(&self, name: Option<&str>) -> Result<ResolvedConnection, AmqpError> {
        let profile = self.profile(name)?;

        Ok(ResolvedConnection {
            factory: profile.factory(),
            publish: profile.publish_client().await?,
            admin: profile.admin_client().await?,
        })
    }
}
