//! Activity tracking
//!
//! Trackers are notified of client lifecycle, traffic volume and message
//! events. They are called from the connection tasks, so implementations
//! must be cheap and must not block.

use crate::models::{ClientActivity, HttpRequest, HttpResponse};
use crate::utils::{format_timestamp, now};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::info;

pub trait ActivityTracker: Send + Sync {
    fn client_connected(&self, client: SocketAddr);
    fn client_disconnected(&self, client: SocketAddr);
    fn bytes_received_from_client(&self, client: SocketAddr, bytes: u64);
    fn bytes_sent_to_client(&self, client: SocketAddr, bytes: u64);
    fn bytes_sent_to_server(&self, client: SocketAddr, server: &str, bytes: u64);
    fn bytes_received_from_server(&self, client: SocketAddr, server: &str, bytes: u64);
    fn request_received_from_client(&self, client: SocketAddr, request: &HttpRequest);
    fn request_sent_to_server(&self, client: SocketAddr, server: &str, request: &HttpRequest);
    fn response_received_from_server(&self, client: SocketAddr, server: &str, response: &HttpResponse);
    fn response_sent_to_client(&self, client: SocketAddr);
}

/// Ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopActivityTracker;

impl ActivityTracker for NoopActivityTracker {
    fn client_connected(&self, _client: SocketAddr) {}
    fn client_disconnected(&self, _client: SocketAddr) {}
    fn bytes_received_from_client(&self, _client: SocketAddr, _bytes: u64) {}
    fn bytes_sent_to_client(&self, _client: SocketAddr, _bytes: u64) {}
    fn bytes_sent_to_server(&self, _client: SocketAddr, _server: &str, _bytes: u64) {}
    fn bytes_received_from_server(&self, _client: SocketAddr, _server: &str, _bytes: u64) {}
    fn request_received_from_client(&self, _client: SocketAddr, _request: &HttpRequest) {}
    fn request_sent_to_server(&self, _client: SocketAddr, _server: &str, _request: &HttpRequest) {}
    fn response_received_from_server(&self, _client: SocketAddr, _server: &str, _response: &HttpResponse) {}
    fn response_sent_to_client(&self, _client: SocketAddr) {}
}

/// Process-wide totals
#[derive(Debug, Default)]
pub struct ActivityTotals {
    pub clients_connected: AtomicU64,
    pub requests_received: AtomicU64,
    pub responses_sent: AtomicU64,
    pub bytes_from_clients: AtomicU64,
    pub bytes_to_clients: AtomicU64,
    pub bytes_to_servers: AtomicU64,
    pub bytes_from_servers: AtomicU64,
}

/// Keeps counters per client and logs a JSON summary when a client leaves.
#[derive(Debug, Default)]
pub struct LoggingActivityTracker {
    totals: ActivityTotals,
    clients: Mutex<HashMap<SocketAddr, ClientActivity>>,
}

impl LoggingActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn totals(&self) -> &ActivityTotals {
        &self.totals
    }

    /// Snapshot of a connected client's counters
    pub fn client_activity(&self, client: SocketAddr) -> Option<ClientActivity> {
        self.clients.lock().ok()?.get(&client).cloned()
    }

    fn update(&self, client: SocketAddr, apply: impl FnOnce(&mut ClientActivity)) {
        if let Ok(mut clients) = self.clients.lock() {
            if let Some(activity) = clients.get_mut(&client) {
                apply(activity);
            }
        }
    }
}

impl ActivityTracker for LoggingActivityTracker {
    fn client_connected(&self, client: SocketAddr) {
        self.totals.clients_connected.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut clients) = self.clients.lock() {
            clients.insert(
                client,
                ClientActivity {
                    client: client.to_string(),
                    connected_at: format_timestamp(now()),
                    ..ClientActivity::default()
                },
            );
        }
    }

    fn client_disconnected(&self, client: SocketAddr) {
        let activity = self
            .clients
            .lock()
            .ok()
            .and_then(|mut clients| clients.remove(&client));
        if let Some(mut activity) = activity {
            activity.disconnected_at = Some(format_timestamp(now()));
            match serde_json::to_string(&activity) {
                Ok(json) => info!("📊 Client activity: {}", json),
                Err(e) => info!("📊 Client {} disconnected ({})", client, e),
            }
        }
    }

    fn bytes_received_from_client(&self, client: SocketAddr, bytes: u64) {
        self.totals.bytes_from_clients.fetch_add(bytes, Ordering::Relaxed);
        self.update(client, |a| a.bytes_from_client += bytes);
    }

    fn bytes_sent_to_client(&self, client: SocketAddr, bytes: u64) {
        self.totals.bytes_to_clients.fetch_add(bytes, Ordering::Relaxed);
        self.update(client, |a| a.bytes_to_client += bytes);
    }

    fn bytes_sent_to_server(&self, client: SocketAddr, _server: &str, bytes: u64) {
        self.totals.bytes_to_servers.fetch_add(bytes, Ordering::Relaxed);
        self.update(client, |a| a.bytes_to_servers += bytes);
    }

    fn bytes_received_from_server(&self, client: SocketAddr, _server: &str, bytes: u64) {
        self.totals.bytes_from_servers.fetch_add(bytes, Ordering::Relaxed);
        self.update(client, |a| a.bytes_from_servers += bytes);
    }

    fn request_received_from_client(&self, client: SocketAddr, _request: &HttpRequest) {
        self.totals.requests_received.fetch_add(1, Ordering::Relaxed);
        self.update(client, |a| a.requests_received += 1);
    }

    fn request_sent_to_server(&self, _client: SocketAddr, _server: &str, _request: &HttpRequest) {}

    fn response_received_from_server(&self, _client: SocketAddr, _server: &str, _response: &HttpResponse) {}

    fn response_sent_to_client(&self, client: SocketAddr) {
        self.totals.responses_sent.fetch_add(1, Ordering::Relaxed);
        self.update(client, |a| a.responses_sent += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Method, Version};

    #[test]
    fn test_counts_per_client() {
        let tracker = LoggingActivityTracker::new();
        let client: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        tracker.client_connected(client);
        tracker.bytes_received_from_client(client, 120);
        tracker.request_received_from_client(
            client,
            &HttpRequest::new(Method::GET, "/", Version::HTTP_11),
        );
        tracker.response_sent_to_client(client);

        let activity = tracker.client_activity(client).unwrap();
        assert_eq!(activity.bytes_from_client, 120);
        assert_eq!(activity.requests_received, 1);
        assert_eq!(activity.responses_sent, 1);

        tracker.client_disconnected(client);
        assert!(tracker.client_activity(client).is_none());
        assert_eq!(tracker.totals().clients_connected.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_unknown_client_only_updates_totals() {
        let tracker = LoggingActivityTracker::new();
        let client: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        tracker.bytes_sent_to_server(client, "a.test:80", 10);
        assert_eq!(tracker.totals().bytes_to_servers.load(Ordering::Relaxed), 10);
        assert!(tracker.client_activity(client).is_none());
    }
}
