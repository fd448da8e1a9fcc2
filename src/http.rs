//! HTTP control surface for the mode manager.
//!
//! A plain background thread serving four routes; the heavy lifting is all
//! in [`ModeManager`], this is just transport:
//!
//! ```text
//! curl -X POST http://localhost:8080/enable
//! curl -X POST http://localhost:8080/disable
//! curl -X POST http://localhost:8080/toggle
//! curl http://localhost:8080/status
//! ```

use std::io;
use std::sync::Arc;
use std::thread;

use serde::Serialize;
use tiny_http::{Header, Method, Response, Server};

use crate::control::{ModeManager, ModeStatus};

#[derive(Serialize)]
struct ToggleReply {
    success: bool,
    changed: bool,
    tracking_enabled: bool,
}

#[derive(Serialize)]
struct ErrorReply {
    success: bool,
    error: &'static str,
}

/// Running control server; stops (and joins its thread) on `stop` or drop.
pub struct ControlServer {
    server: Arc<Server>,
    worker: Option<thread::JoinHandle<()>>,
}

impl ControlServer {
    /// Bind `addr` (e.g. `"0.0.0.0:8080"`) and serve requests on a
    /// background thread.
    pub fn spawn(addr: &str, mode: Arc<ModeManager>) -> io::Result<Self> {
        let server = Arc::new(Server::http(addr).map_err(io::Error::other)?);
        log::info!("HTTP control server listening on http://{addr}");

        let worker = {
            let server = Arc::clone(&server);
            thread::spawn(move || {
                for request in server.incoming_requests() {
                    let (status, body) = route(request.method(), request.url(), &mode);
                    let response = Response::from_string(body)
                        .with_status_code(status)
                        .with_header(
                            Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
                                .expect("static header"),
                        );
                    if let Err(e) = request.respond(response) {
                        log::warn!("failed to send HTTP response: {e}");
                    }
                }
                log::debug!("HTTP control server thread exiting");
            })
        };

        Ok(Self { server, worker: Some(worker) })
    }

    pub fn stop(&mut self) {
        self.server.unblock();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn route(method: &Method, url: &str, mode: &ModeManager) -> (u16, String) {
    match (method, url) {
        (&Method::Post, "/enable") => {
            let changed = mode.enable();
            (200, reply(changed, mode.autonomous_enabled()))
        }
        (&Method::Post, "/disable") => {
            let changed = mode.disable();
            (200, reply(changed, mode.autonomous_enabled()))
        }
        (&Method::Post, "/toggle") => {
            let enabled = mode.toggle();
            (200, reply(true, enabled))
        }
        (&Method::Get, "/status") => (200, status_body(&mode.status())),
        _ => (
            404,
            serde_json::to_string(&ErrorReply { success: false, error: "unknown endpoint" })
                .expect("serializable reply"),
        ),
    }
}

fn reply(changed: bool, tracking_enabled: bool) -> String {
    serde_json::to_string(&ToggleReply { success: true, changed, tracking_enabled })
        .expect("serializable reply")
}

fn status_body(status: &ModeStatus) -> String {
    serde_json::to_string(status).expect("serializable status")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModeConfig;

    fn mode() -> ModeManager {
        ModeManager::new(ModeConfig::default())
    }

    #[test]
    fn enable_reports_change_then_idempotence() {
        let mode = mode();

        let (status, body) = route(&Method::Post, "/enable", &mode);
        assert_eq!(status, 200);
        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["changed"], true);
        assert_eq!(v["tracking_enabled"], true);

        let (_, body) = route(&Method::Post, "/enable", &mode);
        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["changed"], false);
        assert_eq!(v["tracking_enabled"], true);
    }

    #[test]
    fn toggle_round_trips() {
        let mode = mode();
        let (_, body) = route(&Method::Post, "/toggle", &mode);
        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["tracking_enabled"], true);

        let (_, body) = route(&Method::Post, "/toggle", &mode);
        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["tracking_enabled"], false);
    }

    #[test]
    fn status_exposes_active_source() {
        let mode = mode();
        let (status, body) = route(&Method::Get, "/status", &mode);
        assert_eq!(status, 200);
        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["active_source"], "none");
        assert_eq!(v["tracking_enabled"], false);
    }

    #[test]
    fn unknown_route_is_404() {
        let mode = mode();
        let (status, _) = route(&Method::Get, "/nope", &mode);
        assert_eq!(status, 404);
        let (status, _) = route(&Method::Get, "/enable", &mode);
        assert_eq!(status, 404, "enable is POST-only");
    }

    #[test]
    fn server_binds_and_stops() {
        let mode = Arc::new(ModeManager::new(ModeConfig::default()));
        let mut server = ControlServer::spawn("127.0.0.1:0", mode).unwrap();
        server.stop();
    }
}
