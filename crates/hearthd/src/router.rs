use data::DataManager;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

/// One routed request: the argument rest of the message line plus the data
/// manager handlers operate through.
pub struct Request {
    pub args: String,
    pub manager: Arc<DataManager>,
}

type BoxedHandler =
    Arc<dyn Fn(Request) -> Pin<Box<dyn Future<Output = Option<String>> + Send>> + Send + Sync>;

/// Routes inbound operation lines by their leading name to registered
/// handlers. A handler is an async function registered under a name; its
/// optional string result is sent back to the requesting peer.
pub struct Router {
    handlers: RwLock<HashMap<String, BoxedHandler>>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a handler under an operation name, replacing any previous
    /// one.
    pub fn register<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<String>> + Send + 'static,
    {
        let boxed: BoxedHandler = Arc::new(move |request| Box::pin(handler(request)));
        self.handlers
            .write()
            .unwrap()
            .insert(name.to_string(), boxed);
    }

    pub fn unregister(&self, name: &str) {
        self.handlers.write().unwrap().remove(name);
    }

    /// Dispatches one message line. The first word selects the handler; the
    /// remainder becomes the request arguments.
    pub async fn dispatch(&self, line: &str, manager: &Arc<DataManager>) -> Option<String> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let (name, args) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let handler = self.handlers.read().unwrap().get(name).cloned();
        match handler {
            Some(handler) => {
                handler(Request {
                    args: args.trim().to_string(),
                    manager: manager.clone(),
                })
                .await
            }
            None => {
                tracing::debug!(operation = name, "no handler registered for operation");
                Some(format!("error unknown operation \"{name}\""))
            }
        }
    }
}

/// Installs the built-in data operations: `get <alias> <token> [default]`,
/// `set <alias> <token> <value>` and `sync [alias]`.
pub fn register_data_operations(router: &Router) {
    router.register("get", |request: Request| async move {
        let mut parts = request.args.splitn(3, char::is_whitespace);
        let (Some(alias), Some(token)) = (parts.next(), parts.next()) else {
            return Some("error usage: get <alias> <token> [default]".to_string());
        };
        let default = parts
            .next()
            .filter(|rest| !rest.is_empty())
            .map(parse_value);
        let value = request.manager.get_value(alias, token, default).await;
        Some(match value {
            Some(value) => value.to_string(),
            None => "null".to_string(),
        })
    });

    router.register("set", |request: Request| async move {
        let mut parts = request.args.splitn(3, char::is_whitespace);
        let (Some(alias), Some(token), Some(raw)) = (parts.next(), parts.next(), parts.next())
        else {
            return Some("error usage: set <alias> <token> <value>".to_string());
        };
        let value = parse_value(raw);
        let ok = request
            .manager
            .set_value(alias, token, value)
            .await;
        Some(ok.to_string())
    });

    router.register("sync", |request: Request| async move {
        let alias = request.args.split_whitespace().next();
        request.manager.sync(alias).await;
        Some("true".to_string())
    });
}

/// Values arrive as JSON where they parse as such, as bare strings
/// otherwise.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
