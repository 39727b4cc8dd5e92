use clap::Parser;
use clap_derive::Parser;
use mockets::{Mocket, MocketConfig, ReceiveOutcome, SendOptions};
use rand::Rng;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn, Level};

/// Runs two connected mockets on localhost and sends messages of random sizes from one to the
///  other
#[derive(Parser)]
struct Args {
    #[clap(long, default_value_t = 1000)]
    num_messages: usize,

    #[clap(long, default_value_t = 8000)]
    max_message_size: usize,

    #[clap(long, default_value_t = false)]
    unreliable: bool,

    #[clap(long, default_value_t = false)]
    unsequenced: bool,

    /// outgoing bytes per second, 0 for no limit
    #[clap(long, default_value_t = 0)]
    rate_limit: u32,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .try_init()
        .ok();

    let addr_a: SocketAddr = "127.0.0.1:9871".parse()?;
    let addr_b: SocketAddr = "127.0.0.1:9872".parse()?;
    let config = MocketConfig {
        transmit_rate_limit: args.rate_limit,
        validation: rand::thread_rng().gen(),
        ..Default::default()
    };

    let sender = Mocket::bind(config.clone(), addr_a, addr_b).await?;
    let receiver = Mocket::bind(config, addr_b, addr_a).await?;

    let reliable = !args.unreliable;
    let sequenced = !args.unsequenced;
    let num_messages = args.num_messages;
    let max_message_size = args.max_message_size;

    let start = Instant::now();
    let send_task = tokio::spawn(async move {
        let mut rng = rand::thread_rng();
        let mut total = 0;
        for i in 0..num_messages {
            let len = rng.gen_range(1..=max_message_size);
            let message: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let options = SendOptions {
                tag: (i % 4) as u16,
                ..Default::default()
            };
            sender.send(reliable, sequenced, &message, &options).await?;
            total += len;
        }
        info!("sent {} messages with {} bytes", num_messages, total);
        Ok::<_, anyhow::Error>(sender)
    });

    let mut buf = vec![0u8; max_message_size];
    let mut num_received = 0;
    let mut bytes_received = 0;
    while num_received < num_messages {
        match receiver.receive(&mut buf, Duration::from_secs(2)).await {
            ReceiveOutcome::Message(n) => {
                num_received += 1;
                bytes_received += n;
            }
            ReceiveOutcome::Timeout => {
                warn!("no message for 2 seconds - giving up");
                break;
            }
            ReceiveOutcome::Closed => break,
        }
    }
    let elapsed = start.elapsed();
    info!("received {} messages with {} bytes in {:?}", num_received, bytes_received, elapsed);

    let sender = send_task.await??;
    let stats = sender.statistics().await;
    info!("sender: {} packets sent, {} retransmitted", stats.sent_packets, stats.retransmits);
    let stats = receiver.statistics().await;
    info!("receiver: {} packets received, {} duplicates, {} discarded for lack of room",
        stats.received_packets, stats.discarded_duplicate, stats.discarded_no_room);

    sender.close();
    sender.wait_terminated(Duration::from_secs(5)).await;
    Ok(())
}
