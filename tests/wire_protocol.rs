use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_test::assert_ok;
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use ftv_engine::auth::SharedPassword;
use ftv_engine::engine::Engine;
use ftv_engine::notification::{Notification, Outbox};
use ftv_engine::notify::NotifyHub;
use ftv_engine::wire;

// ── Test infrastructure ──────────────────────────────────────

struct Server {
    addr: SocketAddr,
    engine: Arc<Engine>,
    outbox_rx: tokio::sync::mpsc::UnboundedReceiver<Notification>,
}

async fn start_test_server() -> Server {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("ftv_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let (outbox, outbox_rx) = Outbox::channel();
    let engine = Arc::new(Engine::new(dir.join("ftv.wal"), Arc::new(NotifyHub::new()), outbox).unwrap());
    let auth = Arc::new(SharedPassword::new("ftv"));

    let engine2 = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine2.clone();
            let auth = auth.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, auth).await;
            });
        }
    });

    Server { addr, engine, outbox_rx }
}

struct Client {
    framed: Framed<TcpStream, LinesCodec>,
}

impl Client {
    async fn raw(addr: SocketAddr) -> Self {
        let socket = TcpStream::connect(addr).await.unwrap();
        Self {
            framed: Framed::new(socket, LinesCodec::new()),
        }
    }

    async fn connect(addr: SocketAddr) -> Self {
        let mut client = Self::raw(addr).await;
        let hello = client.call(json!({ "op": "auth", "password": "ftv" })).await;
        assert_eq!(hello["ok"], true);
        client
    }

    async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("timed out waiting for server")
            .expect("connection closed")
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn call(&mut self, request: Value) -> Value {
        self.framed.send(request.to_string()).await.unwrap();
        self.recv().await
    }

    /// `data` of a successful response.
    async fn ok(&mut self, request: Value) -> Value {
        let response = self.call(request).await;
        assert_eq!(response["ok"], true, "unexpected failure: {response}");
        response["data"].clone()
    }
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn wrong_password_is_rejected() {
    let server = start_test_server().await;
    let mut client = Client::raw(server.addr).await;
    let response = client.call(json!({ "op": "auth", "password": "nope" })).await;
    assert_eq!(response["ok"], false);
    assert_eq!(response["error"]["kind"], "auth");
    let closed = tokio::time::timeout(Duration::from_secs(5), client.framed.next()).await.unwrap();
    assert!(closed.is_none());
}

#[tokio::test]
async fn requests_before_auth_are_rejected() {
    let server = start_test_server().await;
    let mut client = Client::raw(server.addr).await;
    let response = client
        .call(json!({ "op": "daily_overview", "date": "2024-03-15" }))
        .await;
    assert_eq!(response["error"]["kind"], "auth");
}

#[tokio::test]
async fn availability_over_the_wire() {
    let server = start_test_server().await;
    let mut client = Client::connect(server.addr).await;

    let cam = client.ok(json!({ "op": "create_equipment", "nickname": "Sony A" })).await;
    let cam_id = cam["id"].as_str().unwrap().to_string();
    let booking = client
        .ok(json!({
            "op": "create_filming_session",
            "name": "Concert",
            "start": "2024-03-15T13:30:00",
            "end": "2024-03-15T15:00:00",
            "location": "Aula",
            "equipment": [cam_id],
        }))
        .await;
    assert_eq!(booking["category"], "filming_session");

    let busy = client
        .ok(json!({
            "op": "check_availability",
            "subject_id": cam_id,
            "start": "2024-03-15T14:00",
            "end": "2024-03-15T16:00",
        }))
        .await;
    assert_eq!(busy["available"], false);
    let conflict = &busy["conflicts"][0];
    assert_eq!(conflict["type"], "filming_session");
    assert_eq!(conflict["id"], booking["id"]);
    assert_eq!(conflict["date"], "2024-03-15");
    assert_eq!(conflict["time_from"], "13:30");
    assert_eq!(conflict["time_to"], "15:00");
    assert_eq!(conflict["location"], "Aula");

    let free = client
        .ok(json!({
            "op": "check_availability",
            "subject_id": cam_id,
            "start": "2024-03-15T15:00",
            "end": "2024-03-15T16:00",
        }))
        .await;
    assert_eq!(free, json!({ "available": true, "conflicts": [] }));

    let clash = client
        .call(json!({
            "op": "create_filming_session",
            "name": "Other",
            "start": "2024-03-15T14:30",
            "end": "2024-03-15T15:30",
            "equipment": [cam_id],
        }))
        .await;
    assert_eq!(clash["ok"], false);
    assert_eq!(clash["error"]["kind"], "conflict");
}

#[tokio::test]
async fn malformed_requests_keep_the_connection() {
    let server = start_test_server().await;
    let mut client = Client::connect(server.addr).await;

    let bad = client.call(json!({ "op": "teleport" })).await;
    assert_eq!(bad["error"]["kind"], "validation");
    let bad = client
        .call(json!({ "op": "check_availability", "subject_id": Ulid::new().to_string(), "start": "tomorrow", "end": "later" }))
        .await;
    assert_eq!(bad["error"]["kind"], "validation");
    let missing = client
        .call(json!({
            "op": "check_availability",
            "subject_id": Ulid::new().to_string(),
            "start": "2024-03-15T14:00",
            "end": "2024-03-15T16:00",
        }))
        .await;
    assert_eq!(missing["error"]["kind"], "not_found");

    let overview = client.ok(json!({ "op": "daily_overview", "date": "2024-03-15" })).await;
    assert_eq!(overview["subjects"], json!([]));
}

#[tokio::test]
async fn import_validate_then_commit() {
    let server = start_test_server().await;
    let mut client = Client::connect(server.addr).await;
    let rows = json!([
        { "vezetekNev": "Kiss", "keresztNev": "Anna", "email": "anna@x.hu", "kezdesEve": 2025, "tagozat": "F", "stab": "A" },
        { "vezetekNev": "Nagy", "keresztNev": "Béla", "email": "bela@x.hu", "kezdesEve": "2025", "tagozat": "f", "stab": "A" },
        { "vezetekNev": "Kiss", "keresztNev": "Anna", "email": "ANNA@x.hu" },
    ]);

    let report = client.ok(json!({ "op": "validate_import", "rows": rows })).await;
    assert_eq!(report["valid_rows"], 1);
    assert_eq!(report["invalid_rows"], 2);
    assert_eq!(report["created_preview"]["classes"], json!(["2025F"]));
    assert_eq!(report["created_preview"]["teams"], json!(["A"]));
    assert_eq!(report["errors"][0]["kind"], "duplicate_in_batch");

    let again = client.ok(json!({ "op": "validate_import", "rows": rows })).await;
    assert_eq!(again, report);

    let result = client
        .ok(json!({ "op": "commit_import", "rows": rows, "send_emails": false }))
        .await;
    assert_eq!(result["created_users"], 1);
    assert_eq!(result["failed_rows"], 2);
    assert_eq!(result["rows"][1]["status"], "created");
    assert_eq!(result["rows"][1]["username"], "bela");
    assert_eq!(server.engine.directory().classes().len(), 1);
}

#[tokio::test]
async fn csv_preview_over_the_wire() {
    let server = start_test_server().await;
    let mut client = Client::connect(server.addr).await;
    let content = "Vezetéknév;Keresztnév;E-mail;Telefonszám\nKiss;Anna;anna@x.hu;123\n";
    let preview = client.ok(json!({ "op": "preview_import_csv", "content": content })).await;
    assert_eq!(preview["report"]["valid_rows"], 1);
    assert_eq!(preview["rows"][0]["last_name"], "Kiss");

    let bad = client
        .call(json!({ "op": "preview_import_csv", "content": "name;mail\nx;y\n" }))
        .await;
    assert_eq!(bad["error"]["kind"], "validation");
}

#[tokio::test]
async fn xlsx_preview_over_the_wire() {
    let server = start_test_server().await;
    let mut client = Client::connect(server.addr).await;

    let mut workbook = rust_xlsxwriter::Workbook::new();
    let sheet = workbook.add_worksheet();
    for (col, name) in ["Vezetéknév", "Keresztnév", "E-mail", "Kezdés éve", "Tagozat"].iter().enumerate() {
        sheet.write_string(0, col as u16, *name).unwrap();
    }
    sheet.write_string(1, 0, "Kiss").unwrap();
    sheet.write_string(1, 1, "Anna").unwrap();
    sheet.write_string(1, 2, "anna@x.hu").unwrap();
    sheet.write_number(1, 3, 2025).unwrap();
    sheet.write_string(1, 4, "F").unwrap();
    let content = BASE64.encode(workbook.save_to_buffer().unwrap());

    let preview = client.ok(json!({ "op": "preview_import_xlsx", "content": content })).await;
    assert_eq!(preview["report"]["valid_rows"], 1);
    assert_eq!(preview["report"]["created_preview"]["classes"], json!(["2025F"]));
    assert_eq!(preview["rows"][0]["email"], "anna@x.hu");

    let bad = client
        .call(json!({ "op": "preview_import_xlsx", "content": "not base64!" }))
        .await;
    assert_eq!(bad["error"]["kind"], "validation");
    assert!(server.engine.directory().classes().is_empty());
}

#[tokio::test]
async fn finalizing_an_assignment_notifies_once() {
    let mut server = start_test_server().await;
    let mut client = Client::connect(server.addr).await;

    let person = client
        .ok(json!({ "op": "create_person", "first_name": "Anna", "last_name": "Kiss", "email": "anna@x.hu" }))
        .await;
    let session = client
        .ok(json!({
            "op": "create_filming_session",
            "name": "Gála",
            "start": "2024-03-15T18:00",
            "end": "2024-03-15T21:00",
            "participants": [person["id"]],
        }))
        .await;
    let assignment_id = Ulid::new().to_string();
    let save = |finalized: bool| {
        json!({
            "op": "save_assignment",
            "assignment": {
                "id": assignment_id,
                "session_id": session["id"],
                "members": [{ "person_id": person["id"], "role": "operator" }],
                "finalized": finalized,
            },
        })
    };

    let draft = client.ok(save(false)).await;
    assert_eq!(draft["transition"], "unchanged");
    let finalized = client.ok(save(true)).await;
    assert_eq!(finalized["transition"], "finalized");
    let repeat = client.ok(save(true)).await;
    assert_eq!(repeat["transition"], "unchanged");

    let first = assert_ok!(server.outbox_rx.try_recv());
    assert_eq!(first.recipients, vec!["anna@x.hu".to_string()]);
    assert!(server.outbox_rx.try_recv().is_err());
}

#[tokio::test]
async fn listen_pushes_subject_events() {
    let server = start_test_server().await;
    let mut listener = Client::connect(server.addr).await;
    let mut writer = Client::connect(server.addr).await;

    let cam = writer.ok(json!({ "op": "create_equipment", "nickname": "Cam" })).await;
    let subscribed = listener.ok(json!({ "op": "listen", "subject_id": cam["id"] })).await;
    assert_eq!(subscribed["added"], true);

    writer
        .ok(json!({ "op": "set_equipment_functional", "id": cam["id"], "functional": false }))
        .await;

    let push = listener.recv().await;
    assert_eq!(push["channel"], cam["id"]);
    assert_eq!(push["event"]["EquipmentUpdated"]["functional"], false);

    let gone = listener.ok(json!({ "op": "unlisten", "subject_id": cam["id"] })).await;
    assert_eq!(gone["removed"], true);
}
