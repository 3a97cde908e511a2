//! Shared state of the directory services

use std::{net::IpAddr, sync::Arc};

use anyhow::{Context, Result};

use crate::{
    config::{ChildMap, Config},
    dump::DumpService,
    mail::Mailer,
    registry::SourceRegistry,
    store::Store,
    verify::{Requester, VerificationOptions, VerificationQueue},
};

/// The shared app state.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The node store
    pub store: Store,
    /// Mapping between source hostnames and ids
    pub registry: SourceRegistry,
    /// Full and differential dumps
    pub dump: DumpService,
    /// Registrations awaiting email confirmation
    pub verification: VerificationQueue,
    /// Settings the request handlers need
    pub settings: Arc<Settings>,
}

/// The parts of the [`Config`] used while handling requests.
#[derive(Debug, Clone)]
pub struct Settings {
    pub name: String,
    pub admin_addresses: Vec<IpAddr>,
    pub read_only: bool,
    pub verification_disabled: bool,
    pub child_maps: Vec<ChildMap>,
}

impl AppState {
    /// Build the state from `config`, restoring the source registry from `store`.
    pub fn new(config: &Config, store: Store, mailer: Arc<dyn Mailer>) -> Result<Self> {
        let registry = SourceRegistry::load(store.sources()?)
            .context("failed to restore the source registry")?;
        let dump = DumpService::new(store.clone(), registry.clone());
        let options = VerificationOptions {
            map_name: config.name.clone(),
            from: config.mail.from.clone(),
            public_url: config.public_url.clone(),
            expiry: config.verification.expiry,
            require_matching_address: config.verification.require_matching_address,
        };
        let verification = VerificationQueue::new(store.clone(), mailer, options);
        let settings = Settings {
            name: config.name.clone(),
            admin_addresses: config.admin_addresses.clone(),
            read_only: config.read_only,
            verification_disabled: config.verification.disabled,
            child_maps: config.child_maps.clone(),
        };
        Ok(Self {
            store,
            registry,
            dump,
            verification,
            settings: Arc::new(settings),
        })
    }

    /// Whether `addr` is one of the configured admin addresses.
    pub fn is_admin(&self, addr: IpAddr) -> bool {
        let addr = addr.to_canonical();
        self.settings
            .admin_addresses
            .iter()
            .any(|admin| admin.to_canonical() == addr)
    }

    /// The [`Requester`] for a request from `addr`.
    pub fn requester(&self, addr: IpAddr) -> Requester {
        Requester {
            addr: addr.to_canonical(),
            is_admin: self.is_admin(addr),
        }
    }
}
