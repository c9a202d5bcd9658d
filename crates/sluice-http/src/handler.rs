use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use crate::{config::ConfigError, request::HttpRequest, response::HttpResponse};

/// Free-form `key: value` options attached to a handler instance in the
/// config file.
#[derive(Clone, Debug, Default)]
pub struct HandlerOptions {
    options: HashMap<String, String>,
}

impl HandlerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: String) {
        self.options.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.options.get(name).map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.get(name).unwrap_or(default)
    }

    pub fn get_bool(&self, name: &str, default: bool) -> bool {
        self.get(name).map_or(default, |v| matches!(v, "true" | "yes" | "1"))
    }
}

/// Gateway interface: a handler either responds or passes the request on to
/// the next link of the chain.
pub trait HttpHandler: Send + Sync {
    fn handle_request(&self, request: &mut HttpRequest<'_>, response: &mut HttpResponse<'_>);
}

/// Builds handler instances for one module name.
pub trait HttpHandlerFactory: Send + Sync {
    fn create(&self, options: &HandlerOptions) -> Arc<dyn HttpHandler>;

    fn module_name(&self) -> &'static str;

    fn vendor_name(&self) -> &'static str;
}

/// Registry of handler factories (by module) and configured instances (by
/// name).
pub struct HandlerRegistry {
    factories: Mutex<HashMap<&'static str, Box<dyn HttpHandlerFactory>>>,
    instances: Mutex<HashMap<String, Arc<dyn HttpHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self { factories: Mutex::new(HashMap::new()), instances: Mutex::new(HashMap::new()) }
    }

    pub fn register_factory(&self, factory: Box<dyn HttpHandlerFactory>) {
        let mut factories = self.factories.lock().unwrap_or_else(PoisonError::into_inner);
        factories.insert(factory.module_name(), factory);
    }

    /// Instantiates `name` from `module` with its options; reuses an
    /// existing instance of the same name.
    pub fn create_instance(
        &self,
        name: &str,
        module: &str,
        options: &HandlerOptions,
    ) -> Result<Arc<dyn HttpHandler>, ConfigError> {
        {
            let instances = self.instances.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = instances.get(name) {
                return Ok(Arc::clone(existing));
            }
        }
        let factories = self.factories.lock().unwrap_or_else(PoisonError::into_inner);
        let factory = factories
            .get(module)
            .ok_or_else(|| ConfigError::UnknownModule(module.to_string()))?;
        let handler = factory.create(options);
        self.instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), Arc::clone(&handler));
        Ok(handler)
    }

    /// Registers a pre-built instance under a name, bypassing the factory
    /// path.
    pub fn insert_instance(&self, name: &str, handler: Arc<dyn HttpHandler>) {
        self.instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), handler);
    }

    pub fn get_instance(&self, name: &str) -> Option<Arc<dyn HttpHandler>> {
        self.instances.lock().unwrap_or_else(PoisonError::into_inner).get(name).cloned()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
