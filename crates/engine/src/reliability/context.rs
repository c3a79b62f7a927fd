//! Diagnostic context attached to failed units of work

use crate::error::{context_keys, ErrorContext};

/// Where a unit of work ran
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkContext {
    pub tenant: Option<String>,
    pub hostname: String,
}

impl WorkContext {
    pub fn new(tenant: Option<String>) -> Self {
        Self {
            tenant,
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
        }
    }

    /// Name and id of the calling thread
    pub fn thread_label() -> String {
        let thread = std::thread::current();
        match thread.name() {
            Some(name) => format!("{name} {:?}", thread.id()),
            None => format!("{:?}", thread.id()),
        }
    }

    /// Add host, thread and tenant entries
    pub fn attach(&self, context: &mut ErrorContext) {
        context.insert(context_keys::HOSTNAME, &self.hostname);
        context.insert(context_keys::THREAD, Self::thread_label());
        if let Some(tenant) = &self.tenant {
            context.insert(context_keys::TENANT, tenant);
        }
    }
}
