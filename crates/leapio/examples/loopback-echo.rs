//! Echo service behind a platform, driven by a peer on the other end of an
//! in-memory link.
//!
//! Run with:
//!   cargo run --example loopback-echo

use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant};

use leapio::channel::{ChannelIo, MessageCodec, RRR_CHANNEL};
use leapio::device::{loopback_pair, Device, DeviceShutdown};
use leapio::rrr::{ServiceContext, ServiceStub};
use leapio::umf::{HeaderFormat, LinkConfig, Message};
use leapio::{LogLevel, Platform, PlatformConfig};

const ECHO_SERVICE: u8 = 5;

struct Echo;

impl ServiceStub for Echo {
    fn init(&mut self, ctx: &ServiceContext) {
        eprintln!("echo service up as id {}", ctx.service_id());
    }

    fn request(&mut self, message: Message) -> Option<Message> {
        Message::from_payload(0, 0, message.payload()).ok()
    }
}

/// Drive the peer's receive path until a reply lands or a second passes.
fn await_reply(
    io: &ChannelIo,
    replies: &Receiver<Message>,
) -> Result<Message, Box<dyn std::error::Error>> {
    let deadline = Instant::now() + Duration::from_secs(1);
    loop {
        while io.poll()? {}
        if let Ok(reply) = replies.try_recv() {
            return Ok(reply);
        }
        if Instant::now() > deadline {
            return Err("no reply within a second".into());
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = PlatformConfig::default();
    config.io.link = LinkConfig::loopback(HeaderFormat::Sequenced);
    config.logging.level = LogLevel::Info;
    config.logging.init();

    let (host, peer) = loopback_pair();

    let platform = Platform::builder(config.clone())
        .service(ECHO_SERVICE, Echo)
        .build(host)?;
    platform.init()?;

    let halves = peer.split()?.boxed();
    let peer_io = ChannelIo::new(halves.reader, halves.writer, &config.io)?;
    let replies = peer_io.receiver::<MessageCodec>(RRR_CHANNEL)?;

    for text in ["ping", "a somewhat longer request that spans chunks"] {
        peer_io.send_message(
            RRR_CHANNEL,
            Message::from_payload(RRR_CHANNEL, ECHO_SERVICE, text.as_bytes())?,
        )?;
        let reply = await_reply(&peer_io, &replies)?;
        println!(
            "service {} replied: {}",
            reply.service_id(),
            String::from_utf8_lossy(reply.payload())
        );
    }

    println!("{:?}", platform.stats());
    platform.uninit();
    platform.uninit_complete();
    halves.shutdown.shutdown();
    Ok(())
}
