use reqwest::{Client, StatusCode, header};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use strata_bucket::{BucketCoordinator, CoordinatorSettings, LocalFs, SandboxResolver};
use strata_common::config::ServerConfig;
use strata_common::{BucketPath, FileType};
use strata_coordinator::{AppState, router};
use tempfile::TempDir;
use tokio::net::TcpListener;

const SECRET: &str = "test-secret-123";

// Helper to spawn a server on a random port
async fn spawn_server(secret: Option<&str>) -> (String, TempDir, BucketCoordinator) {
    let dir = tempfile::tempdir().unwrap();
    let settings = CoordinatorSettings {
        capacity: 1 << 20,
        commit_grace: Duration::from_secs(3600),
        request_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(10),
        subdivisions: 1000,
        snapshot_path: None,
    };
    let coordinator = BucketCoordinator::new(
        settings,
        Arc::new(SandboxResolver::new(dir.path())),
        Arc::new(LocalFs),
    );

    let server = ServerConfig {
        storage_node_secret: secret.map(str::to_string),
        default_redirect: "https://strata.example".to_string(),
        ..ServerConfig::default()
    };
    let app = router(Arc::new(AppState::new(coordinator.clone(), &server)));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}", addr), dir, coordinator)
}

fn path(p: &str) -> BucketPath {
    BucketPath::parse(p).unwrap()
}

async fn get_queue(client: &Client, base_url: &str) -> Value {
    let res = client
        .get(format!("{}/bucketqueue", base_url))
        .bearer_auth(SECRET)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    res.json().await.unwrap()
}

/// Poll the queue until a request for `p` shows up and return its timestamp
async fn wait_for_request(client: &Client, base_url: &str, p: &str) -> u64 {
    for _ in 0..500 {
        let queue = get_queue(client, base_url).await;
        let found = queue["items"]
            .as_array()
            .unwrap()
            .iter()
            .find(|item| item["type"] == "request" && item["path"] == p)
            .map(|item| item["timestamp"].as_u64().unwrap());
        if let Some(timestamp) = found {
            return timestamp;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("request for {p} never appeared");
}

#[tokio::test]
async fn test_health_needs_no_auth() {
    let (base_url, _dir, _) = spawn_server(Some(SECRET)).await;
    let client = Client::new();

    let res = client
        .get(format!("{}/health", base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["x-powered-by"], "Strata");
    assert_eq!(res.text().await.unwrap(), r#"{"status":"healthy"}"#);
}

#[tokio::test]
async fn test_root_redirects() {
    let (base_url, _dir, _) = spawn_server(Some(SECRET)).await;
    let client = Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();

    let res = client.get(format!("{}/", base_url)).send().await.unwrap();
    assert!(res.status().is_redirection());
    assert_eq!(res.headers()[header::LOCATION], "https://strata.example");
}

#[tokio::test]
async fn test_queue_requires_bearer_token() {
    let (base_url, _dir, _) = spawn_server(Some(SECRET)).await;
    let client = Client::new();

    let res = client
        .get(format!("{}/bucketqueue", base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    assert_eq!(res.text().await.unwrap(), "Forbidden");

    let res = client
        .get(format!("{}/bucketqueue", base_url))
        .bearer_auth("wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    let res = client
        .post(format!("{}/bucketqueue/txrequestdata?timestamp=1&previousBytesTransferred=0", base_url))
        .body("data")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_unconfigured_secret_refuses_everything() {
    let (base_url, _dir, _) = spawn_server(None).await;
    let client = Client::new();

    let res = client
        .get(format!("{}/bucketqueue", base_url))
        .bearer_auth(SECRET)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_commit_flow() {
    let (base_url, dir, coordinator) = spawn_server(Some(SECRET)).await;
    let client = Client::new();

    std::fs::create_dir_all(dir.path().join("shared")).unwrap();
    std::fs::write(dir.path().join("shared").join("a.txt"), b"hello world").unwrap();
    coordinator
        .admit(path("shared:a.txt"), FileType::File, 11)
        .await;

    let queue = get_queue(&client, &base_url).await;
    let item = &queue["items"][0];
    assert_eq!(item["type"], "commit");
    assert_eq!(item["path"], "shared:a.txt");
    assert_eq!(item["fileType"], "file");
    assert_eq!(item["size"], 11);
    assert!(queue["minTimestamp"].is_u64());
    let timestamp = item["timestamp"].as_u64().unwrap();

    let res = client
        .get(format!(
            "{}/bucketqueue/resolvecommit?timestamp={}&start=0&end=5",
            base_url, timestamp
        ))
        .bearer_auth(SECRET)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        res.headers()[header::CONTENT_TYPE],
        "application/octet-stream"
    );
    assert_eq!(res.bytes().await.unwrap().as_ref(), b"hello");
    assert!(!coordinator.queues().commits()[0].already_committed_once);

    let res = client
        .get(format!(
            "{}/bucketqueue/resolvecommit?timestamp={}&start=5&end=11",
            base_url, timestamp
        ))
        .bearer_auth(SECRET)
        .send()
        .await
        .unwrap();
    assert_eq!(res.bytes().await.unwrap().as_ref(), b" world");
    assert!(coordinator.queues().commits()[0].already_committed_once);

    // Unknown timestamp: another node already finished it
    let res = client
        .get(format!(
            "{}/bucketqueue/resolvecommit?timestamp=1&start=0&end=5",
            base_url
        ))
        .bearer_auth(SECRET)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_delete_and_move_resolution() {
    let (base_url, _dir, coordinator) = spawn_server(Some(SECRET)).await;
    let client = Client::new();

    coordinator.remove(&path("shared:gone"), 4);
    coordinator.move_object(&path("shared:x"), &path("shared:y"));
    let queues = coordinator.queues();
    let delete_ts = queues.deletes()[0].timestamp;
    let move_ts = queues.moves()[0].timestamp;

    let res = client
        .get(format!(
            "{}/bucketqueue/resolvedelete?timestamp={}",
            base_url, delete_ts
        ))
        .bearer_auth(SECRET)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = client
        .get(format!(
            "{}/bucketqueue/resolvemove?timestamp={}",
            base_url, move_ts
        ))
        .bearer_auth(SECRET)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let queues = coordinator.queues();
    assert!(queues.deletes()[0].already_committed_once);
    assert!(queues.moves()[0].already_committed_once);

    let res = client
        .get(format!(
            "{}/bucketqueue/resolvefoldercommit?timestamp={}",
            base_url, delete_ts
        ))
        .bearer_auth(SECRET)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_pull_request_flow() {
    let (base_url, dir, coordinator) = spawn_server(Some(SECRET)).await;
    let client = Client::new();

    let fetch = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.request_file(&path("shared:doc.txt"), None).await })
    };
    let timestamp = wait_for_request(&client, &base_url, "shared:doc.txt").await;

    let res = client
        .post(format!(
            "{}/bucketqueue/initrequest?timestamp={}",
            base_url, timestamp
        ))
        .bearer_auth(SECRET)
        .json(&serde_json::json!({ "fileType": "file", "size": 5 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let chunk_url = format!(
        "{}/bucketqueue/txrequestdata?timestamp={}&previousBytesTransferred=0",
        base_url, timestamp
    );
    let res = client
        .post(&chunk_url)
        .bearer_auth(SECRET)
        .body("hel")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["bytesTransferred"], 3);

    // A second node racing on the same offset loses
    let res = client
        .post(&chunk_url)
        .bearer_auth(SECRET)
        .body("xyz")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);

    let res = client
        .post(format!(
            "{}/bucketqueue/txrequestdata?timestamp={}&previousBytesTransferred=3",
            base_url, timestamp
        ))
        .bearer_auth(SECRET)
        .body("lo")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let object = fetch.await.unwrap().unwrap();
    assert_eq!(object.data, b"hello");
    assert_eq!(
        std::fs::read(dir.path().join("shared").join("doc.txt")).unwrap(),
        b"hello"
    );
}

#[tokio::test]
async fn test_mark_not_found() {
    let (base_url, _dir, coordinator) = spawn_server(Some(SECRET)).await;
    let client = Client::new();

    let fetch = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.request_file(&path("shared:missing"), None).await })
    };
    let timestamp = wait_for_request(&client, &base_url, "shared:missing").await;

    let url = format!(
        "{}/bucketqueue/txrequestmarknotfound?timestamp={}",
        base_url, timestamp
    );
    let res = client.post(&url).bearer_auth(SECRET).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    assert!(fetch.await.unwrap().unwrap_err().is_not_found());

    let res = client.post(&url).bearer_auth(SECRET).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
}
