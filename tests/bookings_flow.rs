use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

use lessond::studio::StudioManager;
use lessond::wire;

const HOUR: i64 = 3_600_000;
const WEEK: i64 = 7 * 24 * HOUR;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<StudioManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("lessond_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let sm = Arc::new(StudioManager::new(dir, 1000));

    let sm2 = sm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let sm = sm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, sm, "lessond".to_string(), None).await;
            });
        }
    });

    (addr, sm)
}

async fn connect(addr: SocketAddr) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(format!("studio_{}", Ulid::new()))
        .user("lessond")
        .password("lessond");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

/// Collect the data rows out of a simple-query response.
fn rows(messages: Vec<SimpleQueryMessage>) -> Vec<tokio_postgres::SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn create_lesson(client: &tokio_postgres::Client, capacity: u32, start: i64) -> Ulid {
    let lid = Ulid::new();
    client
        .batch_execute(&format!(
            r#"INSERT INTO lessons (id, start, "end", capacity, deadline_hours, status, title)
               VALUES ('{lid}', {start}, {end}, {capacity}, 24, 'published', 'Test lesson')"#,
            end = start + HOUR,
        ))
        .await
        .unwrap();
    lid
}

async fn book(client: &tokio_postgres::Client, lesson_id: Ulid) -> (Ulid, String, Option<i32>) {
    let bid = Ulid::new();
    let uid = Ulid::new();
    let result = rows(client
        .simple_query(&format!(
            "INSERT INTO bookings (id, lesson_id, user_id) VALUES ('{bid}', '{lesson_id}', '{uid}')"
        ))
        .await
        .unwrap());
    assert_eq!(result.len(), 1);
    let status = result[0].get("status").unwrap().to_string();
    let position = result[0].get("position").map(|p| p.parse::<i32>().unwrap());
    (bid, status, position)
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn booking_under_capacity_is_confirmed() {
    let (addr, _sm) = start_test_server().await;
    let client = connect(addr).await;

    let lid = create_lesson(&client, 2, now_ms() + 100 * HOUR).await;
    let (_bid, status, position) = book(&client, lid).await;
    assert_eq!(status, "confirmed");
    assert_eq!(position, None);
}

#[tokio::test]
async fn booking_over_capacity_reports_queue_position() {
    let (addr, _sm) = start_test_server().await;
    let client = connect(addr).await;

    let lid = create_lesson(&client, 1, now_ms() + 100 * HOUR).await;
    let (_b1, status1, _) = book(&client, lid).await;
    let (_b2, status2, pos2) = book(&client, lid).await;
    let (_b3, status3, pos3) = book(&client, lid).await;

    assert_eq!(status1, "confirmed");
    assert_eq!(status2, "waitlisted");
    assert_eq!(pos2, Some(1));
    assert_eq!(status3, "waitlisted");
    assert_eq!(pos3, Some(2));

    let waitlist = rows(client
        .simple_query(&format!("SELECT * FROM waitlist WHERE lesson_id = '{lid}'"))
        .await
        .unwrap());
    assert_eq!(waitlist.len(), 2);
    assert_eq!(waitlist[0].get("position"), Some("1"));
    assert_eq!(waitlist[1].get("position"), Some("2"));
}

#[tokio::test]
async fn double_booking_is_rejected() {
    let (addr, _sm) = start_test_server().await;
    let client = connect(addr).await;

    let lid = create_lesson(&client, 5, now_ms() + 100 * HOUR).await;
    let uid = Ulid::new();

    client
        .batch_execute(&format!(
            "INSERT INTO bookings (id, lesson_id, user_id) VALUES ('{}', '{lid}', '{uid}')",
            Ulid::new()
        ))
        .await
        .unwrap();

    let err = client
        .batch_execute(&format!(
            "INSERT INTO bookings (id, lesson_id, user_id) VALUES ('{}', '{lid}', '{uid}')",
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already has a booking"));

    let bookings = rows(client
        .simple_query(&format!("SELECT * FROM bookings WHERE lesson_id = '{lid}'"))
        .await
        .unwrap());
    assert_eq!(bookings.len(), 1);
}

#[tokio::test]
async fn cancellation_promotes_waitlist_head() {
    let (addr, _sm) = start_test_server().await;
    let client = connect(addr).await;

    let lid = create_lesson(&client, 1, now_ms() + 100 * HOUR).await;
    let (seated, _, _) = book(&client, lid).await;
    let (head, _, _) = book(&client, lid).await;

    client
        .batch_execute(&format!("DELETE FROM bookings WHERE id = '{seated}'"))
        .await
        .unwrap();

    let waitlist = rows(client
        .simple_query(&format!("SELECT * FROM waitlist WHERE lesson_id = '{lid}'"))
        .await
        .unwrap());
    assert!(waitlist.is_empty());

    let bookings = rows(client
        .simple_query(&format!("SELECT * FROM bookings WHERE lesson_id = '{lid}'"))
        .await
        .unwrap());
    let promoted = bookings
        .iter()
        .find(|r| r.get("id") == Some(head.to_string().as_str()))
        .unwrap();
    assert_eq!(promoted.get("status"), Some("confirmed"));
    assert_eq!(promoted.get("waitlisted"), Some("f"));
}

#[tokio::test]
async fn cancellation_with_reason_is_recorded() {
    let (addr, _sm) = start_test_server().await;
    let client = connect(addr).await;

    let lid = create_lesson(&client, 2, now_ms() + 100 * HOUR).await;
    let (bid, _, _) = book(&client, lid).await;

    client
        .batch_execute(&format!(
            "UPDATE bookings SET status = 'cancelled', reason = 'weather' WHERE id = '{bid}'"
        ))
        .await
        .unwrap();

    let bookings = rows(client
        .simple_query(&format!("SELECT * FROM bookings WHERE lesson_id = '{lid}'"))
        .await
        .unwrap());
    assert_eq!(bookings[0].get("status"), Some("cancelled"));
    assert_eq!(bookings[0].get("reason"), Some("weather"));
}

#[tokio::test]
async fn late_cancellation_is_refused() {
    let (addr, _sm) = start_test_server().await;
    let client = connect(addr).await;

    // Starts in 1h, deadline 24h — already inside the window
    let lid = create_lesson(&client, 2, now_ms() + HOUR).await;
    let (bid, _, _) = book(&client, lid).await;

    let err = client
        .batch_execute(&format!("DELETE FROM bookings WHERE id = '{bid}'"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("cancellation window has passed"));
}

#[tokio::test]
async fn attendance_marking_over_sql() {
    let (addr, _sm) = start_test_server().await;
    let client = connect(addr).await;

    let lid = create_lesson(&client, 5, now_ms() + 100 * HOUR).await;
    let (showed, _, _) = book(&client, lid).await;
    let (ghosted, _, _) = book(&client, lid).await;

    client
        .batch_execute(&format!("UPDATE bookings SET attended = true WHERE id = '{showed}'"))
        .await
        .unwrap();
    client
        .batch_execute(&format!("UPDATE bookings SET attended = false WHERE id = '{ghosted}'"))
        .await
        .unwrap();

    let stats = rows(client.simple_query("SELECT * FROM booking_stats").await.unwrap());
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].get("total"), Some("2"));
    assert_eq!(stats[0].get("completed"), Some("1"));
    assert_eq!(stats[0].get("no_show"), Some("1"));
}

#[tokio::test]
async fn rollover_spawns_next_week_lesson() {
    let (addr, _sm) = start_test_server().await;
    let client = connect(addr).await;

    let start = now_ms() + 100 * HOUR;
    let lid = create_lesson(&client, 3, start).await;
    let (_b1, _, _) = book(&client, lid).await;
    let (_b2, _, _) = book(&client, lid).await;

    let result = rows(client
        .simple_query(&format!("ROLLOVER '{lid}'"))
        .await
        .unwrap());
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].get("completed"), Some("2"));
    let successor_id = result[0].get("successor_id").unwrap().to_string();

    let lessons = rows(client.simple_query("SELECT * FROM lessons").await.unwrap());
    assert_eq!(lessons.len(), 2);

    let source = lessons
        .iter()
        .find(|r| r.get("id") == Some(lid.to_string().as_str()))
        .unwrap();
    assert_eq!(source.get("status"), Some("archived"));

    let successor = lessons
        .iter()
        .find(|r| r.get("id") == Some(successor_id.as_str()))
        .unwrap();
    assert_eq!(successor.get("status"), Some("published"));
    assert_eq!(
        successor.get("start").unwrap().parse::<i64>().unwrap(),
        start + WEEK
    );
    assert_eq!(successor.get("active_count"), Some("0"));
}

#[tokio::test]
async fn schedule_window_filters_lessons() {
    let (addr, _sm) = start_test_server().await;
    let client = connect(addr).await;

    let base = now_ms() + 100 * HOUR;
    let _this_week = create_lesson(&client, 3, base).await;
    let next_week = create_lesson(&client, 3, base + WEEK).await;

    let visible = rows(client
        .simple_query(&format!(
            r#"SELECT * FROM lessons WHERE start >= {} AND "end" <= {}"#,
            base + WEEK - HOUR,
            base + WEEK + 2 * HOUR,
        ))
        .await
        .unwrap());
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].get("id"), Some(next_week.to_string().as_str()));
}
