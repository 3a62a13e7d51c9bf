#![forbid(unsafe_code)]

//! One full reconciliation pass against a canned-response registry: a stale
//! deployed release upgrades, a desired-only chart installs, an orphan is
//! reported but left alone.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use fleethelm_chart::{ChartClient, ChartSpec, DeployedRelease, HelmError, RepoEntry};
use fleethelm_config::{Artifact, Namespace, Repo};
use fleethelm_registry::PackageCatalog;
use fleethelm_sync::NamespaceWorker;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

async fn serve_one(listener: &TcpListener, body: &str) {
    let (mut sock, _) = listener.accept().await.expect("accept");
    let mut buf = vec![0u8; 64 * 1024];
    let mut read = 0;
    loop {
        let n = sock.read(&mut buf[read..]).await.expect("read request");
        read += n;
        let text = String::from_utf8_lossy(&buf[..read]).to_string();
        if let Some(head_end) = text.find("\r\n\r\n") {
            let content_length = text
                .lines()
                .find_map(|l| {
                    l.to_ascii_lowercase().strip_prefix("content-length:").map(str::to_string)
                })
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if read - (head_end + 4) >= content_length {
                break;
            }
        }
        if n == 0 {
            break;
        }
    }
    let response = format!(
        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    );
    sock.write_all(response.as_bytes()).await.expect("write response");
    let _ = sock.shutdown().await;
}

fn ts(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339).expect("timestamp").with_timezone(&Utc)
}

struct RecordingClient {
    deployed: Vec<DeployedRelease>,
    installed: Mutex<Vec<ChartSpec>>,
}

#[async_trait]
impl ChartClient for RecordingClient {
    async fn list_deployed(&self) -> Result<Vec<DeployedRelease>, HelmError> {
        Ok(self.deployed.clone())
    }
    async fn add_or_update_repo(&self, _entry: &RepoEntry) -> Result<(), HelmError> {
        Ok(())
    }
    async fn install_or_upgrade(&self, spec: &ChartSpec) -> Result<(), HelmError> {
        self.installed.lock().unwrap().push(spec.clone());
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pass_upgrades_installs_and_reports_orphans() {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind");
    let port = listener.local_addr().expect("addr").port();

    let server = tokio::spawn(async move {
        serve_one(
            &listener,
            r#"{"results":[
                {"repo":"charts","path":"stable","name":"app-1.0.0.tgz","modified":"2024-01-01T00:00:00Z"},
                {"repo":"charts","path":"stable","name":"app-1.1.0.tgz","modified":"2024-02-01T00:00:00Z"},
                {"repo":"charts","path":"stable","name":"fresh-2.0.0.tgz","modified":"2024-02-01T00:00:00Z"}
            ]}"#,
        )
        .await;
    });

    let domain = format!("http://127.0.0.1:{port}/artifactory");
    let namespace = Namespace {
        name: "apps".into(),
        sync_interval: 30,
        artifact: Artifact {
            domain: domain.clone(),
            username: "svc".into(),
            password: "hunter2".into(),
            repos: vec![Repo {
                name: "charts".into(),
                decide_by_version: true,
                paths: vec!["stable".into()],
            }],
        },
    };

    let client = Arc::new(RecordingClient {
        deployed: vec![
            DeployedRelease {
                release: "app".into(),
                chart_name: "app".into(),
                chart_version: "1.0.0".into(),
                last_deployed: ts("2024-01-05T00:00:00Z"),
            },
            DeployedRelease {
                release: "legacy".into(),
                chart_name: "legacy".into(),
                chart_version: "0.9.0".into(),
                last_deployed: ts("2023-06-01T00:00:00Z"),
            },
        ],
        installed: Mutex::new(Vec::new()),
    });

    let worker = NamespaceWorker::new(
        "prod".into(),
        namespace,
        client.clone(),
        PackageCatalog::new().expect("catalog"),
    );
    let summary = worker.reconcile_once().await.expect("pass");
    server.await.expect("server task");

    assert_eq!(summary.installed, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.orphaned, 1);

    let installed = client.installed.lock().unwrap();
    let refs: Vec<&str> = installed.iter().map(|s| s.chart_ref.as_str()).collect();
    assert_eq!(
        refs,
        vec![
            format!("{domain}/charts/stable/app-1.1.0.tgz").as_str(),
            format!("{domain}/charts/stable/fresh-2.0.0.tgz").as_str(),
        ]
    );
    // The orphan is never touched.
    assert!(installed.iter().all(|s| s.release_name != "legacy"));
}
