/// Integration tests for the dashboard read path over a real database file.
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use halo_wire::{SensorField, parse_message};
use ingest::query::{GroupBy, HeartbeatQuery, TimeWindow, series};
use ingest::storage::{HeartbeatRecord, HeartbeatStore};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 8, 12, 0, 0).unwrap()
}

fn seed(store: &mut HeartbeatStore, line: &str, age: TimeDelta, site: Option<&str>) {
    let hb = parse_message(line).expect("valid line");
    let rec = HeartbeatRecord::from_heartbeat(hb, now() - age, site.map(str::to_owned));
    store.append(&rec).expect("append");
}

fn seeded_db() -> (tempfile::TempDir, HeartbeatQuery) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("halo_heartbeats.db");
    let mut store = HeartbeatStore::open(&path).expect("open store");
    seed(&mut store, "AA,Lobby,C=21.0,AQI=10", TimeDelta::minutes(10), Some("North"));
    seed(&mut store, "BB,Gym,C=18.5,AQI=n/a", TimeDelta::hours(3), Some("South"));
    seed(&mut store, "AA,Lobby,C=20.0", TimeDelta::hours(20), Some("North"));
    seed(&mut store, "CC,Roof,C=5", TimeDelta::days(3), None);
    seed(&mut store, "AA,Lobby,C=19.0", TimeDelta::days(30), Some("North"));
    drop(store);
    let query = HeartbeatQuery::open(&path).expect("open query");
    (dir, query)
}

#[test]
fn windows_select_progressively_more_rows() {
    let (_dir, q) = seeded_db();
    let counts: Vec<usize> = TimeWindow::ALL
        .iter()
        .map(|w| q.in_window(*w, now()).expect("query").len())
        .collect();
    assert_eq!(counts, vec![1, 2, 2, 3, 4]);
}

#[test]
fn window_rows_are_time_ordered() {
    let (_dir, q) = seeded_db();
    let rows = q.in_window(TimeWindow::Last7Days, now()).expect("query");
    let names: Vec<&str> = rows.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["Roof", "Lobby", "Gym", "Lobby"]);
}

#[test]
fn series_by_name_and_site() {
    let (_dir, q) = seeded_db();
    let rows = q.in_window(TimeWindow::LastDay, now()).expect("query");

    let by_name = series(&rows, SensorField::Celsius, GroupBy::Name);
    assert_eq!(by_name["Lobby"].len(), 2);
    assert_eq!(by_name["Gym"][0].value, Some(18.5));

    let by_site = series(&rows, SensorField::Aqi, GroupBy::Site);
    let north: Vec<Option<f64>> = by_site["North"].iter().map(|p| p.value).collect();
    assert_eq!(north, vec![None, Some(10.0)]);
    assert_eq!(by_site["South"][0].value, None);
}

#[test]
fn polling_by_id_picks_up_only_new_rows() {
    let (_dir, q) = seeded_db();
    let all = q.after_id(0).expect("poll");
    assert_eq!(all.len(), 5);
    let last = all.iter().map(|r| r.id).max().expect("rows");
    assert!(q.after_id(last).expect("poll").is_empty());
}

#[test]
fn distinct_sites_are_listed() {
    let (_dir, q) = seeded_db();
    assert_eq!(q.sites().expect("sites"), vec!["North", "South"]);
}
