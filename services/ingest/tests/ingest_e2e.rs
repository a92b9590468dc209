/// End-to-end tests: real TCP listener, mock sensors, on-disk SQLite.
use chrono::{SubsecRound, Utc};
use halo_test_utils::{MockSensor, heartbeat_line};
use halo_wire::SensorField;
use ingest::acceptor::{Acceptor, AcceptorStats};
use ingest::allowlist::Allowlist;
use ingest::config::{ConnectionLimits, SiteMap};
use ingest::handler::ConnectionContext;
use ingest::query::{HeartbeatQuery, StoredHeartbeat};
use ingest::storage::HeartbeatStore;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

const LOBBY: &str = "AA:BB:CC:DD:EE:01";
const GYM: &str = "AA:BB:CC:DD:EE:02";
const STRANGER: &str = "FF:FF:FF:FF:FF:FF";

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    addr: SocketAddr,
    db_path: PathBuf,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<AcceptorStats>,
    _dir: tempfile::TempDir,
}

impl Harness {
    async fn start(limits: ConnectionLimits, sites: &[(&str, &str)]) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("halo_heartbeats.db");
        let store = HeartbeatStore::open(&db_path).expect("open store");
        let sites: HashMap<String, String> = sites
            .iter()
            .map(|(mac, site)| ((*mac).to_owned(), (*site).to_owned()))
            .collect();
        let ctx = ConnectionContext {
            allowlist: Arc::new(Allowlist::from_ids([LOBBY, GYM])),
            store: Arc::new(Mutex::new(store)),
            sites: Arc::new(SiteMap::new(sites)),
            limits,
            write_attempts: 2,
        };
        let acceptor = Acceptor::bind("127.0.0.1:0", ctx).await.expect("bind");
        let addr = acceptor.local_addr();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(acceptor.run(shutdown_rx));
        Harness {
            addr,
            db_path,
            shutdown_tx,
            task,
            _dir: dir,
        }
    }

    async fn with_defaults() -> Self {
        Self::start(ConnectionLimits::default(), &[]).await
    }

    fn rows(&self) -> Vec<StoredHeartbeat> {
        HeartbeatQuery::open(&self.db_path)
            .expect("open query")
            .all_ordered()
            .expect("read rows")
    }

    /// Poll until at least `n` rows are stored.
    async fn wait_for_rows(&self, n: usize) -> Vec<StoredHeartbeat> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let rows = self.rows();
            if rows.len() >= n {
                return rows;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {} rows, have {}",
                n,
                rows.len()
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn shutdown(self) -> AcceptorStats {
        self.shutdown_tx.send(true).expect("acceptor alive");
        tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .expect("acceptor stops")
            .expect("acceptor task")
    }
}

// ---------------------------------------------------------------------------
// Message handling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn approved_heartbeat_is_stored_once_with_only_sent_fields() {
    let h = Harness::with_defaults().await;
    let mut sensor = MockSensor::connect(h.addr).await.expect("connect");
    sensor
        .send_line(&format!("{},Lobby,C=21.4,RH=40,TVOC=0.12", LOBBY))
        .await
        .expect("send");
    sensor.close().await.expect("close");

    let rows = h.wait_for_rows(1).await;
    let stats = h.shutdown().await;

    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.mac, LOBBY);
    assert_eq!(row.name, "Lobby");
    assert_eq!(row.site, None);
    assert_eq!(row.fields.get(SensorField::Celsius), Some("21.4"));
    assert_eq!(row.fields.get(SensorField::RelativeHumidity), Some("40"));
    assert_eq!(row.fields.get(SensorField::Tvoc), Some("0.12"));
    assert_eq!(row.fields.present_count(), 3);
    assert_eq!(stats.messages.stored, 1);
}

#[tokio::test]
async fn unapproved_identifier_is_not_stored() {
    let h = Harness::with_defaults().await;
    let mut sensor = MockSensor::connect(h.addr).await.expect("connect");
    sensor
        .send_line(&heartbeat_line(STRANGER, "Intruder", &[("C", "99")]))
        .await
        .expect("send");
    // A trailing approved message proves the first one has been processed.
    sensor
        .send_line(&heartbeat_line(GYM, "Gym", &[("C", "18")]))
        .await
        .expect("send");
    sensor.close().await.expect("close");

    let rows = h.wait_for_rows(1).await;
    let stats = h.shutdown().await;

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].mac, GYM);
    assert_eq!(stats.messages.rejected, 1);
}

#[tokio::test]
async fn malformed_message_does_not_close_connection() {
    let h = Harness::with_defaults().await;
    let mut sensor = MockSensor::connect(h.addr).await.expect("connect");
    sensor.send_line("garbage").await.expect("send");
    sensor
        .send_line(&heartbeat_line(LOBBY, "Lobby", &[("CO2cal", "612")]))
        .await
        .expect("send");
    sensor.close().await.expect("close");

    let rows = h.wait_for_rows(1).await;
    let stats = h.shutdown().await;

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].fields.get(SensorField::Co2Cal), Some("612"));
    assert_eq!(stats.messages.malformed, 1);
    assert_eq!(stats.messages.stored, 1);
}

#[tokio::test]
async fn message_split_across_writes_is_reassembled() {
    let h = Harness::with_defaults().await;
    let mut sensor = MockSensor::connect(h.addr).await.expect("connect");
    let line = heartbeat_line(LOBBY, "Lobby", &[("PM2.5", "7"), ("P-hPa", "1013.2")]);
    let (head, tail) = line.split_at(10);
    sensor.send_raw(head.as_bytes()).await.expect("send head");
    tokio::time::sleep(Duration::from_millis(50)).await;
    sensor.send_raw(tail.as_bytes()).await.expect("send tail");
    sensor.send_raw(b"\r\n").await.expect("send terminator");
    sensor.close().await.expect("close");

    let rows = h.wait_for_rows(1).await;
    h.shutdown().await;

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].fields.get(SensorField::Pm2_5), Some("7"));
    assert_eq!(rows[0].fields.get(SensorField::PressureHpa), Some("1013.2"));
}

#[tokio::test]
async fn many_messages_in_one_write_are_each_stored() {
    let h = Harness::with_defaults().await;
    let mut sensor = MockSensor::connect(h.addr).await.expect("connect");
    let batch: String = (0..5)
        .map(|i| format!("{}\n", heartbeat_line(LOBBY, "Lobby", &[("C", &i.to_string())])))
        .collect();
    sensor.send_raw(batch.as_bytes()).await.expect("send");
    sensor.close().await.expect("close");

    let rows = h.wait_for_rows(5).await;
    h.shutdown().await;

    let values: Vec<&str> = rows
        .iter()
        .filter_map(|r| r.fields.get(SensorField::Celsius))
        .collect();
    assert_eq!(values, vec!["0", "1", "2", "3", "4"]);
}

#[tokio::test]
async fn timestamps_are_assigned_at_receipt() {
    let h = Harness::with_defaults().await;
    let before = Utc::now().trunc_subsecs(6);
    let mut sensor = MockSensor::connect(h.addr).await.expect("connect");
    sensor
        .send_line(&heartbeat_line(LOBBY, "Lobby", &[("C", "21")]))
        .await
        .expect("send");
    sensor.close().await.expect("close");

    let rows = h.wait_for_rows(1).await;
    let after = Utc::now();
    h.shutdown().await;

    let at = rows[0].received_at.expect("parseable timestamp");
    assert!(at >= before && at <= after, "{} not in [{}, {}]", at, before, after);
    assert!(rows[0].timestamp.ends_with('Z'));
}

#[tokio::test]
async fn site_is_attached_from_site_map() {
    let h = Harness::start(ConnectionLimits::default(), &[(LOBBY, "North")]).await;
    let mut sensor = MockSensor::connect(h.addr).await.expect("connect");
    sensor
        .send_line(&heartbeat_line(LOBBY, "Lobby", &[("C", "21")]))
        .await
        .expect("send");
    sensor
        .send_line(&heartbeat_line(GYM, "Gym", &[("C", "19")]))
        .await
        .expect("send");
    sensor.close().await.expect("close");

    let rows = h.wait_for_rows(2).await;
    h.shutdown().await;

    let lobby = rows.iter().find(|r| r.mac == LOBBY).expect("lobby row");
    let gym = rows.iter().find(|r| r.mac == GYM).expect("gym row");
    assert_eq!(lobby.site.as_deref(), Some("North"));
    assert_eq!(gym.site, None);
}

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_connections_each_store_their_messages() {
    const SENSORS: usize = 20;
    let h = Harness::with_defaults().await;

    let mut tasks = Vec::new();
    for i in 0..SENSORS {
        let addr = h.addr;
        tasks.push(tokio::spawn(async move {
            let mut sensor = MockSensor::connect(addr).await.expect("connect");
            let name = format!("Room{}", i);
            sensor
                .send_line(&heartbeat_line(LOBBY, &name, &[("C", "20")]))
                .await
                .expect("send");
            sensor.close().await.expect("close");
        }));
    }
    for t in tasks {
        t.await.expect("sensor task");
    }

    let rows = h.wait_for_rows(SENSORS).await;
    let stats = h.shutdown().await;

    assert_eq!(rows.len(), SENSORS);
    let mut ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), SENSORS);
    assert_eq!(stats.accepted, SENSORS as u64);
    assert_eq!(stats.messages.stored, SENSORS as u64);
}

#[tokio::test]
async fn connection_over_limit_is_refused() {
    let limits = ConnectionLimits {
        max_connections: 1,
        ..ConnectionLimits::default()
    };
    let h = Harness::start(limits, &[]).await;

    let mut first = MockSensor::connect(h.addr).await.expect("connect first");
    first
        .send_line(&heartbeat_line(LOBBY, "Lobby", &[("C", "1")]))
        .await
        .expect("send");
    h.wait_for_rows(1).await;

    let mut second = TcpStream::connect(h.addr).await.expect("connect second");
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(5), second.read(&mut buf))
        .await
        .expect("refused connection is closed");
    assert!(matches!(read, Ok(0) | Err(_)));

    // The admitted connection keeps working.
    first
        .send_line(&heartbeat_line(LOBBY, "Lobby", &[("C", "2")]))
        .await
        .expect("send");
    h.wait_for_rows(2).await;
    first.close().await.expect("close");

    let stats = h.shutdown().await;
    assert_eq!(stats.accepted, 1);
    assert_eq!(stats.refused, 1);
}

#[tokio::test]
async fn shutdown_closes_idle_connections_within_grace() {
    let h = Harness::with_defaults().await;
    let mut sensor = MockSensor::connect(h.addr).await.expect("connect");
    sensor
        .send_line(&heartbeat_line(LOBBY, "Lobby", &[("C", "21")]))
        .await
        .expect("send");
    h.wait_for_rows(1).await;

    // The sensor stays connected; shutdown must not wait on it.
    let stats = h.shutdown().await;
    assert_eq!(stats.accepted, 1);
    assert_eq!(stats.forced_closed, 0);
    assert_eq!(stats.messages.stored, 1);
    drop(sensor);
}

#[tokio::test]
async fn listener_stops_accepting_after_shutdown() {
    let h = Harness::with_defaults().await;
    let addr = h.addr;
    h.shutdown().await;

    let result = tokio::time::timeout(Duration::from_secs(2), TcpStream::connect(addr)).await;
    assert!(matches!(result, Ok(Err(_))));
}
