//! Named error constructors for forwarded remote failures

use std::{collections::HashMap, error::Error, fmt, sync::Arc};

type Constructor = Arc<dyn Fn(String) -> Arc<dyn Error + Send + Sync> + Send + Sync>;

/// Error type used when a name is registered without a dedicated type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub name:      String,
    pub backtrace: String
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} raised remotely", self.name)?;
        if !self.backtrace.is_empty() {
            write!(f, "\n{}", self.backtrace)?;
        }
        Ok(())
    }
}

impl Error for RemoteError {}

/// Maps error names reported by services to local error constructors
#[derive(Clone, Default)]
pub struct ExceptionRegistry {
    constructors: HashMap<String, Constructor>
}

impl ExceptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor; it receives the remote backtrace
    pub fn register<F, E>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(String) -> E + Send + Sync + 'static,
        E: Error + Send + Sync + 'static
    {
        let constructor: Constructor =
            Arc::new(move |backtrace: String| -> Arc<dyn Error + Send + Sync> { Arc::new(constructor(backtrace)) });
        self.constructors.insert(name.into(), constructor);
    }

    /// Register a name that rehydrates into a [`RemoteError`]
    pub fn register_name(&mut self, name: impl Into<String>) {
        let name = name.into();
        let label = name.clone();
        self.register(name, move |backtrace| RemoteError { name: label.clone(), backtrace });
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn build(&self, name: &str, backtrace: String) -> Option<Arc<dyn Error + Send + Sync>> {
        self.constructors.get(name).map(|constructor| constructor(backtrace))
    }
}

impl fmt::Debug for ExceptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.constructors.keys().collect();
        names.sort();
        f.debug_struct("ExceptionRegistry").field("names", &names).finish()
    }
}
