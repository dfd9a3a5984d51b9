// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Resolution
//!
//! Declares the exchange, queue and binding a resolved endpoint needs.
//!
//! Declarations are idempotent on the broker side, so the resolver can run
//! on every consumer start: objects that already exist are left as they are
//! and auto-deleted ones are recreated. A declaration the broker rejects,
//! such as an exchange redeclared with a different type, fails the endpoint.

use crate::{
    address::{ResolvedEndpoint, Role},
    client::AdminClient,
    errors::{root_cause_message, AmqpError},
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
};
use tracing::{debug, error};

/// What was declared for an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredTopology {
    pub exchange_name: String,
    pub kind: ExchangeKind,
    /// Declared queue, with its broker-generated name for temporary queues.
    /// `None` for producers.
    pub queue_name: Option<String>,
}

/// Declares endpoint topology through an [`AdminClient`].
pub struct TopologyResolver<'a> {
    admin: &'a dyn AdminClient,
}

impl<'a> TopologyResolver<'a> {
    pub fn new(admin: &'a dyn AdminClient) -> Self {
        TopologyResolver { admin }
    }

    /// Declares the topology of `endpoint`.
    ///
    /// Producers only declare their exchange, and only when its kind was
    /// given with the `type` option. A producer whose kind was inferred from
    /// the address publishes to whatever exchange the consumers declared.
    /// Consumers declare the exchange, the queue and the binding between
    /// them; on the default exchange only the queue is declared.
    pub async fn declare(&self, endpoint: &ResolvedEndpoint) -> Result<DeclaredTopology, AmqpError> {
        if endpoint.kind != ExchangeKind::Default {
            if endpoint.role == Role::Producer && !endpoint.kind_is_explicit {
                debug!(exchange = %endpoint.exchange_name, "exchange kind not given, leaving declaration to consumers");
            } else {
                self.declare_exchange(endpoint).await?;
            }
        }

        let queue_name = match endpoint.role {
            Role::Producer => None,
            Role::Consumer => {
                let name = self.declare_queue(endpoint).await?;
                if endpoint.kind != ExchangeKind::Default {
                    self.bind(endpoint, &name).await?;
                }
                Some(name)
            }
        };

        Ok(DeclaredTopology {
            exchange_name: endpoint.exchange_name.clone(),
            kind: endpoint.kind,
            queue_name,
        })
    }

    async fn declare_exchange(&self, endpoint: &ResolvedEndpoint) -> Result<(), AmqpError> {
        let mut def = ExchangeDefinition::new(&endpoint.exchange_name).kind(endpoint.kind);
        if endpoint.options.durable {
            def = def.durable();
        }
        if endpoint.options.auto_delete {
            def = def.delete();
        }

        debug!(exchange = %endpoint.exchange_name, kind = %endpoint.kind, "declaring exchange");
        self.admin.declare_exchange(&def).await.map_err(|err| {
            error!(
                error = err.to_string(),
                exchange = %endpoint.exchange_name,
                "error to declare the exchange"
            );
            AmqpError::TopologyDeclarationError(root_cause_message(&err))
        })
    }

    async fn declare_queue(&self, endpoint: &ResolvedEndpoint) -> Result<String, AmqpError> {
        let def = QueueDefinition::from_options(endpoint.queue_name.as_deref(), &endpoint.options);

        debug!(queue = ?endpoint.queue_name, "declaring queue");
        let name = self.admin.declare_queue(&def).await.map_err(|err| {
            error!(error = err.to_string(), queue = ?endpoint.queue_name, "error to declare the queue");
            AmqpError::TopologyDeclarationError(root_cause_message(&err))
        })?;

        debug!(queue = %name, "queue declared");
        Ok(name)
    }

    async fn bind(&self, endpoint: &ResolvedEndpoint, queue: &str) -> Result<(), AmqpError> {
        let mut binding = QueueBinding::new(queue).exchange(&endpoint.exchange_name);
        match endpoint.kind {
            ExchangeKind::Direct | ExchangeKind::Topic => {
                binding = binding.routing_key(endpoint.routing_key.as_deref().unwrap_or_default());
            }
            ExchangeKind::Headers => {
                binding = binding.arguments(endpoint.binding_args.clone().unwrap_or_default());
            }
            ExchangeKind::Fanout | ExchangeKind::Default => {}
        }

        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name(),
            binding.exchange_name(),
            binding.key()
        );
        self.admin.bind(&binding).await.map_err(|err| {
            error!(error = err.to_string(), "error to bind queue to exchange");
            AmqpError::TopologyDeclarationError(root_cause_message(&err))
        })
    }
}
