//! Web decoy - fake corporate login portal on axum.
//!
//! Every request is logged with client address, status and duration. Login
//! submissions are recorded with the submitted credentials and always
//! rejected. Responses carry IIS headers.

use async_trait::async_trait;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::{Form, Router};
use serde::Deserialize;
use snare_common::config::WebConfig;
use snare_common::DecoyKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use super::{spawn_serve, DecoyAdapter, DecoyError, DecoyTask, Lifecycle};
use crate::events::SharedSink;

const KIND: DecoyKind = DecoyKind::Web;

const SERVER_HEADER: &str = "Microsoft-IIS/10.0";
const POWERED_BY: &str = "ASP.NET";

/// Shared handler state
pub struct WebState {
    title: String,
    sink: SharedSink,
}

#[derive(Debug, Default, Deserialize)]
pub struct LoginForm {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

pub fn router(state: Arc<WebState>) -> Router {
    Router::new()
        .route("/", get(login_page).post(login_submit))
        .route("/login", get(login_page).post(login_submit))
        .route("/dashboard", get(to_login))
        .route("/admin", get(to_login))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(state.clone(), record_request))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn login_page(State(state): State<Arc<WebState>>) -> Html<String> {
    Html(render_login(&state.title, None))
}

async fn login_submit(
    State(state): State<Arc<WebState>>,
    ConnectInfo(client): ConnectInfo<SocketAddr>,
    Form(form): Form<LoginForm>,
) -> Html<String> {
    state.sink.warning(
        KIND,
        &format!(
            "Login attempt from {}: username={} password={}",
            client, form.username, form.password
        ),
    );
    Html(render_login(
        &state.title,
        Some("The user name or password is incorrect."),
    ))
}

async fn to_login() -> Redirect {
    Redirect::to("/")
}

async fn not_found() -> (StatusCode, Html<&'static str>) {
    (StatusCode::NOT_FOUND, Html(IIS_NOT_FOUND))
}

async fn record_request(
    State(state): State<Arc<WebState>>,
    ConnectInfo(client): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let agent = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(header::SERVER, HeaderValue::from_static(SERVER_HEADER));
    headers.insert("x-powered-by", HeaderValue::from_static(POWERED_BY));

    state.sink.info(
        KIND,
        &format!(
            "{} {} {} -> {} ({} ms) [{}]",
            client,
            method,
            path,
            response.status().as_u16(),
            started.elapsed().as_millis(),
            agent
        ),
    );
    response
}

fn render_login(title: &str, error: Option<&str>) -> String {
    let error = error
        .map(|e| format!("<div class=\"error\">{}</div>", e))
        .unwrap_or_default();
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>{title} - Sign In</title>
<style>
body {{ font-family: Segoe UI, Arial, sans-serif; background: #f3f3f3; }}
.box {{ width: 340px; margin: 120px auto; background: #fff; padding: 32px; border: 1px solid #ddd; }}
.error {{ color: #a80000; margin-bottom: 12px; }}
input {{ width: 100%; margin-bottom: 12px; padding: 6px; }}
</style>
</head>
<body>
<div class="box">
<h2>{title}</h2>
{error}
<form method="post" action="/">
<input type="text" name="username" placeholder="DOMAIN\username">
<input type="password" name="password" placeholder="Password">
<input type="submit" value="Sign in">
</form>
</div>
</body>
</html>
"#,
        title = title,
        error = error
    )
}

const IIS_NOT_FOUND: &str = r#"<!DOCTYPE html PUBLIC "-//W3C//DTD XHTML 1.0 Strict//EN" "http://www.w3.org/TR/xhtml1/DTD/xhtml1-strict.dtd">
<html xmlns="http://www.w3.org/1999/xhtml">
<head>
<meta http-equiv="Content-Type" content="text/html; charset=iso-8859-1"/>
<title>404 - File or directory not found.</title>
</head>
<body>
<div id="header"><h1>Server Error</h1></div>
<div id="content">
 <div class="content-container"><fieldset>
  <h2>404 - File or directory not found.</h2>
  <h3>The resource you are looking for might have been removed, had its name changed, or is temporarily unavailable.</h3>
 </fieldset></div>
</div>
</body>
</html>
"#;

// ============================================================================
// Adapter
// ============================================================================

pub struct WebDecoy {
    config: WebConfig,
    addr: SocketAddr,
    lifecycle: Lifecycle,
}

impl WebDecoy {
    pub fn new(config: WebConfig, addr: SocketAddr) -> Self {
        Self {
            config,
            addr,
            lifecycle: Lifecycle::new(),
        }
    }
}

#[async_trait]
impl DecoyAdapter for WebDecoy {
    fn kind(&self) -> DecoyKind {
        KIND
    }

    async fn start(&self, sink: SharedSink) -> Result<DecoyTask, DecoyError> {
        let guard = self.lifecycle.begin(KIND)?;
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|source| DecoyError::Bind {
                addr: self.addr,
                source,
            })?;

        sink.info(KIND, &format!("Web decoy listening on http://{}", self.addr));
        let state = Arc::new(WebState {
            title: self.config.title.clone(),
            sink: Arc::clone(&sink),
        });
        let token = guard.token();
        Ok(spawn_serve(guard, async move {
            serve(listener, router(state), token).await?;
            sink.info(KIND, "Web decoy stopped");
            Ok(())
        }))
    }

    async fn stop(&self) {
        self.lifecycle.stop().await;
    }
}

/// Serve until the token is cancelled
pub async fn serve(
    listener: TcpListener,
    app: Router,
    token: CancellationToken,
) -> Result<(), DecoyError> {
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { token.cancelled().await })
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventLevel, RecordingSink};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn spawn_app() -> (SocketAddr, Arc<RecordingSink>, CancellationToken) {
        let recorder = Arc::new(RecordingSink::new());
        let state = Arc::new(WebState {
            title: "Contoso Portal".to_string(),
            sink: recorder.clone(),
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let token = CancellationToken::new();
        tokio::spawn(serve(listener, router(state), token.clone()));
        (addr, recorder, token)
    }

    async fn raw_request(addr: SocketAddr, request: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_login_page_and_headers() {
        let (addr, recorder, token) = spawn_app().await;
        let response = raw_request(
            addr,
            "GET / HTTP/1.1\r\nHost: portal\r\nConnection: close\r\n\r\n",
        )
        .await;

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.to_ascii_lowercase().contains("server: microsoft-iis/10.0"));
        assert!(response.contains("Contoso Portal - Sign In"));
        assert!(recorder.contains("GET / -> 200"));
        token.cancel();
    }

    #[tokio::test]
    async fn test_login_attempt_recorded_and_rejected() {
        let (addr, recorder, token) = spawn_app().await;
        let body = "username=CONTOSO%5Cjdoe&password=Summer2025";
        let request = format!(
            "POST / HTTP/1.1\r\nHost: portal\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        let response = raw_request(addr, &request).await;

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("The user name or password is incorrect."));
        let attempts = recorder.messages(EventLevel::Warning, KIND);
        assert_eq!(attempts.len(), 1);
        assert!(attempts[0].contains("username=CONTOSO\\jdoe password=Summer2025"));
        token.cancel();
    }

    #[tokio::test]
    async fn test_dashboard_redirects_and_unknown_is_404() {
        let (addr, _recorder, token) = spawn_app().await;
        let redirect = raw_request(
            addr,
            "GET /dashboard HTTP/1.1\r\nHost: portal\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(redirect.starts_with("HTTP/1.1 303"));

        let missing = raw_request(
            addr,
            "GET /wp-login.php HTTP/1.1\r\nHost: portal\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(missing.starts_with("HTTP/1.1 404"));
        assert!(missing.contains("404 - File or directory not found."));
        token.cancel();
    }
}
