//! Completed-request records and their fixed access-log line format.
//!
//! A line looks like:
//! `::ffff:10.1.2.3 - - [17/Oct/2026:09:03:07 +0000] "GET /x HTTP/1.1" 200 512 "" "curl/8" "a.example.com" 0.012 0.01`
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use hyper::Version;
use serde::{Deserialize, Serialize};

/// One completed request, as handed to the access-log collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessLogRecord {
    pub remote_addr: String,
    /// Arrival time of the request
    pub current_time: DateTime<Utc>,
    pub total_time_ms: u64,
    pub backend_time_ms: u64,
    pub method: String,
    pub url: String,
    pub http_version: String,
    pub status_code: u16,
    /// Bytes written on the client socket, when known
    pub socket_bytes_written: Option<u64>,
    pub referer: Option<String>,
    pub user_agent: Option<String>,
    pub virtual_host: String,
}

impl AccessLogRecord {
    /// Render the record as one access-log line (without trailing newline).
    pub fn format_line(&self) -> String {
        format!(
            "{} - - [{}] \"{} {} HTTP/{}\" {} {} \"{}\" \"{}\" \"{}\" {} {}",
            normalize_remote_addr(&self.remote_addr),
            self.current_time.format("%d/%b/%Y:%H:%M:%S +0000"),
            self.method,
            self.url,
            self.http_version,
            self.status_code,
            self.socket_bytes_written.unwrap_or(0),
            self.referer.as_deref().unwrap_or(""),
            self.user_agent.as_deref().unwrap_or(""),
            self.virtual_host,
            seconds(self.total_time_ms),
            seconds(self.backend_time_ms),
        )
    }
}

fn seconds(ms: u64) -> f64 {
    ms as f64 / 1000.0
}

/// Prefix raw IPv4 addresses with the IPv6-mapped prefix; anything else is kept.
pub fn normalize_remote_addr(addr: &str) -> String {
    match addr.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => format!("::ffff:{v4}"),
        _ => addr.to_string(),
    }
}

/// `HTTP/x` suffix for a request version.
pub fn http_version_label(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_2 => "2.0",
        Version::HTTP_3 => "3.0",
        _ => "1.1",
    }
}
