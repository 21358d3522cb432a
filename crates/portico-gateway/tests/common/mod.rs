//! Shared harness: auth service, gateway and counting mock backends on
//! ephemeral ports.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{Json, Router, extract::Request};
use portico_core::{AuthConfig, Config, Department, Role, ServiceConfig};
use portico_gateway::auth::{NewUser, User, open_database};
use portico_gateway::{AuthServer, AuthState, GatewayBuilder, TokenIssuer};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Service that is configured but never listening.
pub const DOWN_SERVICE: &str = "inventory";

pub struct Harness {
    pub gateway: String,
    pub auth: String,
    pub client: reqwest::Client,
    pub state: AuthState,
    counters: HashMap<String, Arc<AtomicUsize>>,
    _dir: TempDir,
}

async fn listen() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

async fn echo(name: String, counter: Arc<AtomicUsize>, req: Request) -> Json<Value> {
    counter.fetch_add(1, Ordering::SeqCst);
    Json(json!({
        "service": name,
        "method": req.method().as_str(),
        "path": req.uri().path(),
        "query": req.uri().query(),
    }))
}

async fn spawn_backend(name: &str) -> (String, Arc<AtomicUsize>) {
    let counter = Arc::new(AtomicUsize::new(0));
    let (listener, addr) = listen().await;
    let app = Router::new().fallback({
        let name = name.to_string();
        let counter = Arc::clone(&counter);
        move |req: Request| echo(name.clone(), Arc::clone(&counter), req)
    });
    tokio::spawn(async move { axum::serve(listener, app).await });
    (format!("http://{addr}"), counter)
}

impl Harness {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    pub async fn start_with(configure: impl FnOnce(&mut AuthConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut auth_config = AuthConfig::builder()
            .data_dir(dir.path())
            .expose_reset_tokens(true)
            .login_attempts_per_minute(1000)
            .build();
        configure(&mut auth_config);

        let issuer = TokenIssuer::new(
            &TokenIssuer::generate_secret(),
            auth_config.access_token_ttl(),
            auth_config.reset_token_ttl(),
        );
        let db = open_database(dir.path()).unwrap();
        let state = AuthState::new(auth_config.clone(), issuer, &db).unwrap();

        let (auth_listener, auth_addr) = listen().await;
        let auth_url = format!("http://{auth_addr}");

        let mut config = Config {
            auth: auth_config,
            ..Config::default()
        };
        config.gateway.upstream_timeout_secs = 5;
        config.gateway.health_probe_timeout_ms = 500;

        let mut counters = HashMap::new();
        let names: Vec<String> = config.services.keys().cloned().collect();
        for name in names {
            let url = if name == "auth" {
                auth_url.clone()
            } else if name == DOWN_SERVICE {
                let (listener, addr) = listen().await;
                drop(listener);
                format!("http://{addr}")
            } else {
                let (url, counter) = spawn_backend(&name).await;
                counters.insert(name.clone(), counter);
                url
            };
            config.services.insert(name, ServiceConfig::new(url));
        }

        let gateway = GatewayBuilder::new()
            .with_issuer(Arc::clone(&state.issuer))
            .with_config(config)
            .build()
            .unwrap();
        let (gateway_listener, gateway_addr) = listen().await;

        let server = AuthServer::new(state.clone());
        tokio::spawn(async move { server.serve(auth_listener).await });
        tokio::spawn(async move { gateway.serve(gateway_listener).await });

        Self {
            gateway: format!("http://{gateway_addr}"),
            auth: auth_url,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap(),
            state,
            counters,
            _dir: dir,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.gateway)
    }

    pub fn calls(&self, service: &str) -> usize {
        self.counters[service].load(Ordering::SeqCst)
    }

    /// Create an account directly in the store.
    pub fn seed(&self, username: &str, role: Role, department: Department) -> User {
        self.state
            .users
            .create(NewUser {
                username: username.to_string(),
                email: format!("{username}@example.com"),
                password: "secret1".to_string(),
                first_name: "Test".to_string(),
                last_name: "User".to_string(),
                job_title: None,
                role,
                department,
            })
            .unwrap()
    }

    pub async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let resp = self.client.post(self.url(path)).json(&body).send().await.unwrap();
        read(resp).await
    }

    pub async fn get(&self, path: &str, token: Option<&str>) -> (u16, Value) {
        let mut req = self.client.get(self.url(path));
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        read(req.send().await.unwrap()).await
    }

    pub async fn put(&self, path: &str, token: &str, body: Value) -> (u16, Value) {
        let resp = self
            .client
            .put(self.url(path))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .unwrap();
        read(resp).await
    }

    /// Log in through the gateway and return `(access, refresh)`.
    pub async fn login(&self, username: &str, password: &str) -> (String, String) {
        let (status, body) = self
            .post(
                "/auth/login",
                json!({ "username": username, "password": password }),
            )
            .await;
        assert_eq!(status, 200, "login failed: {body}");
        (
            body["accessToken"].as_str().unwrap().to_string(),
            body["refreshToken"].as_str().unwrap().to_string(),
        )
    }
}

pub async fn read(resp: reqwest::Response) -> (u16, Value) {
    let status = resp.status().as_u16();
    let text = resp.text().await.unwrap();
    let body = if text.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&text).unwrap_or(Value::String(text))
    };
    (status, body)
}
