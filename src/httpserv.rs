//! A trivial backend for trying the proxy locally.
//!
//! Every request is answered with `Response from <hostname>:<port>`, which
//! makes it easy to see which upstream a client is stuck to.

use std::{env, fs};

use axum::{extract::State, Router};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct Greeting(String);

impl Greeting {
    pub fn new(name: &str, port: u16) -> Self {
        Self(format!("Response from {}:{}", name, port))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

pub fn router(greeting: Greeting) -> Router {
    Router::new().fallback(handle_any).with_state(greeting)
}

async fn handle_any(State(greeting): State<Greeting>) -> String {
    debug!(reply = %greeting.as_str(), "Answering test request");
    greeting.0
}

/// Best-effort local hostname: `$HOSTNAME`, then `/etc/hostname`.
pub fn hostname() -> String {
    if let Ok(name) = env::var("HOSTNAME") {
        let name = name.trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }
    match fs::read_to_string("/etc/hostname") {
        Ok(name) if !name.trim().is_empty() => name.trim().to_string(),
        Ok(_) => "localhost".to_string(),
        Err(e) => {
            warn!(error = %e, "Could not determine hostname");
            "localhost".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Server;
    use std::net::SocketAddr;

    #[test]
    fn test_greeting_format() {
        assert_eq!(Greeting::new("web-1", 9091).as_str(), "Response from web-1:9091");
    }

    #[test]
    fn test_hostname_is_never_empty() {
        assert!(!hostname().is_empty());
    }

    #[tokio::test]
    async fn test_answers_every_path() {
        let app = router(Greeting::new("web-1", 9091));
        let server = Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0)))
            .serve(app.into_make_service());
        let addr = server.local_addr();
        tokio::spawn(server);

        let client = reqwest::Client::new();
        for path in ["/", "/a/b?c=d"] {
            let body = client
                .post(format!("http://{}{}", addr, path))
                .send()
                .await
                .unwrap()
                .text()
                .await
                .unwrap();
            assert_eq!(body, "Response from web-1:9091");
        }
    }
}
