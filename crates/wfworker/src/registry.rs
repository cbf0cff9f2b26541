use std::collections::HashMap;
use std::sync::Arc;
use wfcore::TaskHandler;

/// Handlers available to a worker, keyed by task type
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler, replacing any previous one for the same type
    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) {
        let task_type = handler.task_type().to_string();
        tracing::info!("Registering task type: {}", task_type);
        self.handlers.insert(task_type, handler);
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    /// Registered task types, sorted
    pub fn list_task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn description(&self, task_type: &str) -> Option<String> {
        self.handlers
            .get(task_type)
            .map(|h| h.description().to_string())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
