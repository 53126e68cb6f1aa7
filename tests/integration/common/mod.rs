#![allow(dead_code)]

use std::{
    fs,
    io::{BufRead, BufReader, Cursor, Read, Write},
    net::{TcpListener, TcpStream},
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
};

use chrono::{DateTime, Utc};
use tether::{
    cache::Clock,
    error::ReleaseError,
    release::{Release, ReleaseAsset, ReleaseFeed},
};
use xz2::write::XzEncoder;

/// Shell script standing in for the server: announces readiness twice, then idles.
pub const FAKE_SERVER: &str = "#!/bin/sh\n\
echo \"booting $*\"\n\
echo 'Server listening on 0.0.0.0:9070'\n\
echo 'Server listening on 0.0.0.0:8080'\n\
exec sleep 30\n";

/// Builds an in-memory `.tar.xz`. Entries ending in `/` become directories;
/// files are stored without any execute permission.
pub fn tar_xz(entries: &[(&str, &str)]) -> Vec<u8> {
    let encoder = XzEncoder::new(Vec::new(), 6);
    let mut builder = tar::Builder::new(encoder);
    for (name, body) in entries {
        let mut header = tar::Header::new_gnu();
        if name.ends_with('/') {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_mode(0o755);
            header.set_cksum();
            builder
                .append_data(&mut header, name, std::io::empty())
                .expect("append directory");
        } else {
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, body.as_bytes())
                .expect("append file");
        }
    }
    let mut encoder = builder.into_inner().expect("finish tar");
    encoder.flush().expect("flush xz");
    encoder.finish().expect("finish xz")
}

/// Release feed serving one release from memory and counting downloads.
pub struct MemoryFeed {
    pub release: Release,
    pub archive: Vec<u8>,
    pub downloads: AtomicUsize,
}

impl MemoryFeed {
    pub fn new(asset_names: &[&str], archive: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            release: Release {
                name: Some("v1.4.0".into()),
                tag_name: "v1.4.0".into(),
                assets: asset_names
                    .iter()
                    .map(|name| ReleaseAsset {
                        name: name.to_string(),
                        download_url: format!("memory://{name}"),
                    })
                    .collect(),
            },
            archive,
            downloads: AtomicUsize::new(0),
        })
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

impl ReleaseFeed for MemoryFeed {
    fn latest_release(&self) -> Result<Release, ReleaseError> {
        Ok(self.release.clone())
    }

    fn open_asset(&self, _asset: &ReleaseAsset) -> Result<Box<dyn Read + Send>, ReleaseError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(Cursor::new(self.archive.clone())))
    }
}

/// Clock whose time only moves when told to.
pub struct ManualClock(Mutex<DateTime<Utc>>);

impl ManualClock {
    pub fn starting_now() -> Arc<Self> {
        Arc::new(Self(Mutex::new(Utc::now())))
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.0.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

/// Canned HTTP response.
pub struct StubResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl StubResponse {
    pub fn empty(status: u16) -> Self {
        Self {
            status,
            content_type: "text/plain",
            body: Vec::new(),
        }
    }

    pub fn json(body: serde_json::Value) -> Self {
        Self {
            status: 200,
            content_type: "application/json",
            body: body.to_string().into_bytes(),
        }
    }

    pub fn bytes(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type: "application/octet-stream",
            body,
        }
    }
}

/// A request seen by [`StubServer`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub body: String,
}

/// Minimal HTTP/1.1 server answering one connection per scripted response.
pub struct StubServer {
    listener: Option<TcpListener>,
    pub url: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    worker: Option<JoinHandle<()>>,
}

impl StubServer {
    pub fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub server");
        let url = format!("http://{}", listener.local_addr().unwrap());
        Self {
            listener: Some(listener),
            url,
            requests: Arc::new(Mutex::new(Vec::new())),
            worker: None,
        }
    }

    /// Starts answering; the n-th connection gets the n-th response.
    pub fn respond(mut self, responses: Vec<StubResponse>) -> Self {
        let listener = self.listener.take().expect("stub already serving");
        let requests = Arc::clone(&self.requests);
        self.worker = Some(thread::spawn(move || {
            for response in responses {
                let Ok((stream, _)) = listener.accept() else {
                    return;
                };
                serve_one(stream, &response, &requests);
            }
        }));
        self
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

fn serve_one(mut stream: TcpStream, response: &StubResponse, log: &Mutex<Vec<RecordedRequest>>) {
    let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));

    let mut request_line = String::new();
    if reader.read_line(&mut request_line).unwrap_or(0) == 0 {
        return;
    }
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let mut content_length = 0usize;
    loop {
        let mut header = String::new();
        if reader.read_line(&mut header).unwrap_or(0) == 0 {
            break;
        }
        let header = header.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':')
            && name.eq_ignore_ascii_case("content-length")
        {
            content_length = value.trim().parse().unwrap_or(0);
        }
    }

    let mut body = vec![0; content_length];
    let _ = reader.read_exact(&mut body);
    log.lock().unwrap().push(RecordedRequest {
        method,
        path,
        body: String::from_utf8_lossy(&body).into_owned(),
    });

    let head = format!(
        "HTTP/1.1 {} Stub\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        response.status,
        response.content_type,
        response.body.len()
    );
    let _ = stream.write_all(head.as_bytes());
    let _ = stream.write_all(&response.body);
    let _ = stream.flush();
}

/// Address on which nothing is listening.
pub fn closed_port_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

/// Writes an executable shell script.
#[cfg(unix)]
pub fn write_script(path: &Path, body: &str) {
    use std::os::unix::fs::PermissionsExt;

    fs::write(path, body).expect("write script");
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).expect("chmod script");
}
