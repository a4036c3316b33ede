use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{HostError, Result};
use crate::manifest::Manifest;
use crate::module::Module;
use crate::service::ServiceId;

/// Service id → providing modules, plus alias → service id.
///
/// Both sides are multimaps in registration order; resolution takes the first
/// entry, so the choice is stable until the registry is rebuilt.
#[derive(Default)]
pub struct ServiceRegistry {
    providers: BTreeMap<ServiceId, Vec<Arc<Module>>>,
    aliases: BTreeMap<String, Vec<ServiceId>>,
}

impl ServiceRegistry {
    pub fn register(&mut self, module: &Arc<Module>, manifest: &Manifest) {
        for decl in &manifest.service_ids {
            tracing::trace!(module = %manifest.name, service = %decl.id, alias = ?decl.alias(), "Registering service");
            self.providers
                .entry(decl.id.clone())
                .or_default()
                .push(Arc::clone(module));
            if let Some(alias) = decl.alias() {
                self.aliases
                    .entry(alias.to_string())
                    .or_default()
                    .push(decl.id.clone());
            }
        }
    }

    pub fn providers(&self, id: &ServiceId) -> &[Arc<Module>] {
        self.providers.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn provider(&self, id: &ServiceId) -> Option<&Arc<Module>> {
        self.providers(id).first()
    }

    pub fn alias(&self, alias: &str) -> Option<&ServiceId> {
        self.aliases.get(alias).and_then(|ids| ids.first())
    }

    /// Resolves a service id, falling back to an alias.
    pub fn resolve(&self, key: &str) -> Result<(ServiceId, Arc<Module>)> {
        let id = ServiceId::new(key);
        if let Some(module) = self.provider(&id) {
            return Ok((id, Arc::clone(module)));
        }

        let id = self.alias(key).ok_or_else(|| {
            HostError::UnableToCreateService(format!("service \"{key}\" is not registered"))
        })?;
        let module = self.provider(id).ok_or_else(|| {
            HostError::UnableToCreateService(format!("alias \"{key}\" points to unregistered {id}"))
        })?;
        Ok((id.clone(), Arc::clone(module)))
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn clear(&mut self) {
        self.providers.clear();
        self.aliases.clear();
    }
}
