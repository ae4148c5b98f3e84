//! Shared fixtures: a fake convergence engine and fake database/dashboard servers.

#![allow(dead_code)]

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;

use dashverify::VerifyConfig;

/// One request as the fake server saw it
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Behaviour switches for the fake server
#[derive(Debug, Clone)]
pub struct ServerBehavior {
    /// Status returned for `/write`
    pub write_status: u16,
    /// Data sources the dashboard knows about
    pub datasources: Vec<String>,
    /// Expected `Authorization` header for dashboard requests
    pub dashboard_auth: String,
}

impl Default for ServerBehavior {
    fn default() -> Self {
        Self {
            write_status: 204,
            datasources: vec!["influxdb_puppet_metrics".to_string()],
            // base64("admin:puppet")
            dashboard_auth: "Basic YWRtaW46cHVwcGV0".to_string(),
        }
    }
}

/// A minimal HTTP/1.1 server that plays both the database and the dashboard.
pub struct FakeServer {
    pub port: u16,
    pub requests: Arc<Mutex<Vec<Recorded>>>,
    written: Arc<Mutex<Vec<String>>>,
}

impl FakeServer {
    pub fn start(behavior: ServerBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake server");
        let port = listener.local_addr().expect("local addr").port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let written = Arc::new(Mutex::new(Vec::new()));

        let thread_requests = Arc::clone(&requests);
        let thread_written = Arc::clone(&written);
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                handle(stream, &behavior, &thread_requests, &thread_written);
            }
        });

        Self {
            port,
            requests,
            written,
        }
    }

    pub fn recorded(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    pub fn written_lines(&self) -> Vec<String> {
        self.written.lock().unwrap().clone()
    }
}

fn handle(
    stream: TcpStream,
    behavior: &ServerBehavior,
    requests: &Mutex<Vec<Recorded>>,
    written: &Mutex<Vec<String>>,
) {
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    // Port probes connect and close without sending anything
    if reader.read_line(&mut request_line).unwrap_or(0) == 0 {
        return;
    }
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default().to_string();

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.push((k.trim().to_string(), v.trim().to_string()));
        }
    }

    let length = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    let _ = reader.read_exact(&mut body);
    let body = String::from_utf8_lossy(&body).to_string();

    let recorded = Recorded {
        method: method.clone(),
        target: target.clone(),
        headers,
        body: body.clone(),
    };
    requests.lock().unwrap().push(recorded.clone());

    let path = target.split('?').next().unwrap_or_default();
    let (status, response_body) = match (method.as_str(), path) {
        ("POST", "/write") => {
            if (200..300).contains(&behavior.write_status) {
                written.lock().unwrap().push(body);
            }
            (behavior.write_status, String::new())
        }
        ("POST", "/query") => {
            let lines = written.lock().unwrap();
            let series: Vec<String> = lines
                .iter()
                .filter_map(|l| l.split([',', ' ']).next())
                .map(|m| format!("{{\"name\":\"{}\",\"columns\":[\"time\"]}}", m))
                .collect();
            (
                200,
                format!(
                    "{{\"results\":[{{\"statement_id\":0,\"series\":[{}]}}]}}",
                    series.join(",")
                ),
            )
        }
        ("GET", p) if p.starts_with("/api/datasources/name/") => {
            let name = percent_decode(&p["/api/datasources/name/".len()..]);
            let name = name.as_str();
            if recorded.header("authorization") != Some(behavior.dashboard_auth.as_str()) {
                (401, "{\"message\":\"Invalid username or password\"}".to_string())
            } else if behavior.datasources.iter().any(|d| d == name) {
                (200, format!("{{\"id\":1,\"name\":\"{}\",\"type\":\"influxdb\"}}", name))
            } else {
                (404, "{\"message\":\"Data source not found\"}".to_string())
            }
        }
        _ => (404, "not found".to_string()),
    };

    let reason = match status {
        200 => "OK",
        204 => "No Content",
        401 => "Unauthorized",
        404 => "Not Found",
        _ => "Error",
    };
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        response_body.len(),
        response_body
    );
    let mut stream = reader.into_inner();
    let _ = stream.write_all(response.as_bytes());
    let _ = stream.flush();
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let Some(Ok(byte)) = s.get(i + 1..i + 3).map(|h| u8::from_str_radix(h, 16)) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).to_string()
}

/// A port nothing listens on
pub fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("local addr").port()
}

/// Configuration pointing the probes at the given ports
pub fn config_for(dashboard_port: u16, database_port: u16) -> VerifyConfig {
    let mut config = VerifyConfig::default();
    config.manifest.dashboard_http_port = dashboard_port;
    config.target.database_port = database_port;
    config.probe.timeout_secs = 2;
    config.probe.timestamp = Some(1523993402);
    config
}

/// Write a fake engine script into `dir`.
///
/// The script appends its last argument (the manifest) to `manifests.log`
/// and exits with the codes from `exit_codes`, one per invocation, repeating
/// the last one. It is run through `bash` so the file is never exec'd directly.
pub fn fake_engine(dir: &Path, exit_codes: &[i32]) -> PathBuf {
    let codes: Vec<String> = exit_codes.iter().map(|c| c.to_string()).collect();
    let script = format!(
        r#"#!/usr/bin/env bash
dir="$(dirname "$0")"
count_file="$dir/count"
count=$(cat "$count_file" 2>/dev/null || echo 0)
echo $((count + 1)) > "$count_file"
for last; do :; done
printf '%s\n---\n' "$last" >> "$dir/manifests.log"
echo "args: $*" >> "$dir/args.log"
codes=({codes})
idx=$count
if [ "$idx" -ge "${{#codes[@]}}" ]; then idx=$((${{#codes[@]}} - 1)); fi
echo "Notice: Applied catalog"
exit "${{codes[$idx]}}"
"#,
        codes = codes.join(" ")
    );
    let path = dir.join("fake-puppet.sh");
    std::fs::write(&path, script).expect("write fake engine");
    path
}

/// Engine config that runs `script` through bash
pub fn engine_config(script: &Path) -> dashverify::EngineConfig {
    dashverify::EngineConfig {
        program: script.to_string_lossy().to_string(),
        prefix: vec!["bash".to_string()],
        ..Default::default()
    }
}

/// Number of times the fake engine in `dir` ran
pub fn engine_runs(dir: &Path) -> usize {
    std::fs::read_to_string(dir.join("count"))
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}
