//! End-to-end throughput benchmark for Chorus.
//!
//! Measures group message throughput over real WebSocket connections. The
//! server must list the benchmark users in a `[[groups]]` entry, e.g.
//!
//! ```toml
//! [[groups]]
//! id = "bench"
//! members = ["bench-0", "bench-1", "bench-2"]
//! ```

use bytes::BytesMut;
use chorus_bench::BENCH_GROUP;
use chorus_protocol::{codec, Frame, FrameCodec, PROTOCOL_VERSION};
use futures_util::{SinkExt, Stream, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const SERVER_URL: &str = "ws://127.0.0.1:8080/ws";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║         Chorus End-to-End Throughput Benchmark               ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Make sure the server is running: cargo run --release        ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    run_group_benchmark(num_clients).await;
}

async fn run_group_benchmark(num_clients: usize) {
    println!("📊 Group Benchmark: {} clients in '{}'", num_clients, BENCH_GROUP);
    println!("   Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let message_count = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let mut handles = Vec::new();

    for client_id in 0..num_clients {
        let msg_count = Arc::clone(&message_count);
        let barrier = Arc::clone(&barrier);

        let handle = tokio::spawn(async move {
            if let Err(e) = run_client(client_id, msg_count, barrier).await {
                eprintln!("Client {} error: {}", client_id, e);
            }
        });
        handles.push(handle);
    }

    barrier.wait().await;
    println!("✓ All {} clients connected", num_clients);

    println!("⏳ Warming up for {}s...", WARMUP_SECS);
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    message_count.store(0, Ordering::SeqCst);
    let start = Instant::now();

    println!("📈 Measuring for {}s...", BENCH_SECS);
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total_messages = message_count.load(Ordering::SeqCst);

    let msgs_per_sec = total_messages as f64 / elapsed.as_secs_f64();
    let msgs_per_sec_per_client = msgs_per_sec / num_clients as f64;

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                         RESULTS                              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!(
        "║  Clients:              {:>10}                           ║",
        num_clients
    );
    println!(
        "║  Duration:             {:>10.2}s                          ║",
        elapsed.as_secs_f64()
    );
    println!(
        "║  Messages Received:    {:>10}                           ║",
        total_messages
    );
    println!(
        "║  Throughput:           {:>10.0} msg/s                    ║",
        msgs_per_sec
    );
    println!(
        "║  Per-Client:           {:>10.0} msg/s                    ║",
        msgs_per_sec_per_client
    );
    println!("╚══════════════════════════════════════════════════════════════╝");

    for handle in handles {
        handle.abort();
    }
}

/// Wait for the next frame, skipping anything that is not binary.
async fn next_frame<S>(receiver: &mut S) -> Result<Frame, BoxError>
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(message) = receiver.next().await {
        if let Message::Binary(data) = message? {
            return Ok(codec::decode(&data)?);
        }
    }
    Err("connection closed".into())
}

async fn run_client(
    client_id: usize,
    message_count: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), BoxError> {
    let (ws, _) = connect_async(SERVER_URL).await?;
    let (mut sender, mut receiver) = ws.split();

    let connect = Frame::connect(PROTOCOL_VERSION.major, format!("bench-{client_id}"), None);
    sender
        .send(Message::Binary(codec::encode(&connect)?.to_vec()))
        .await?;

    match next_frame(&mut receiver).await? {
        Frame::Connected { .. } => {}
        other => return Err(format!("handshake refused: {:?}", other).into()),
    }

    // Joining explicitly also works with auto-join off.
    let join = Frame::join(1, BENCH_GROUP);
    sender
        .send(Message::Binary(codec::encode(&join)?.to_vec()))
        .await?;
    loop {
        match next_frame(&mut receiver).await? {
            Frame::Ack { id: 1 } => break,
            Frame::Error { message, .. } => return Err(message.into()),
            _ => {}
        }
    }

    barrier.wait().await;

    let recv_count = message_count.clone();
    let recv_task = tokio::spawn(async move {
        let codec = FrameCodec::default();
        let mut recv_buf = BytesMut::with_capacity(65536);

        while let Some(result) = receiver.next().await {
            if let Ok(Message::Binary(data)) = result {
                recv_buf.extend_from_slice(&data);
                while let Ok(Some(frame)) = codec.decode_from(&mut recv_buf) {
                    if matches!(frame, Frame::Message { .. }) {
                        recv_count.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    });

    let mut request_id = 2u64;
    loop {
        let frame = Frame::send(request_id, BENCH_GROUP, "x".repeat(64));
        request_id += 1;
        if sender
            .send(Message::Binary(codec::encode(&frame)?.to_vec()))
            .await
            .is_err()
        {
            break;
        }
        tokio::task::yield_now().await;
    }

    recv_task.abort();
    Ok(())
}
