//! postbus demo node
//!
//! Small harness for poking at the fabric from a shell: run a TCP receiver
//! in one terminal, post to it from another, or fan a message out over a
//! multicast group.

use clap::{Parser, Subcommand};
use postbus::{
    DistributedMailbox, DistributedMailboxConfig, Fabric, FabricConfig, GroupMailbox,
    GroupMailboxConfig, LocalMailbox, MailboxAddress, MailboxProcessor, Message, MessageBuffer,
    MessageHandlerList, Result, TimerMessage,
};
use std::any::Any;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const TEXT_MESSAGE_ID: u16 = 0x0010;

/// Demo payload: a tagged line of text.
#[derive(Debug)]
struct TextMessage {
    source: MailboxAddress,
    text: String,
}

impl TextMessage {
    fn new(text: &str) -> Self {
        Self { source: MailboxAddress::default(), text: text.to_string() }
    }

    fn deserialize(buffer: &mut MessageBuffer) -> postbus::Result<Self> {
        Ok(Self { source: MailboxAddress::default(), text: buffer.extract_str()? })
    }
}

impl Message for TextMessage {
    fn message_id(&self) -> u16 {
        TEXT_MESSAGE_ID
    }

    fn source_address(&self) -> &MailboxAddress {
        &self.source
    }

    fn set_source_address(&mut self, address: MailboxAddress) {
        self.source = address;
    }

    fn serialize(&self, buffer: &mut MessageBuffer) -> postbus::Result<()> {
        buffer.insert_str(&self.text)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Parser)]
#[command(name = "postbus", version, about = "postbus: message fabric demo")]
struct Args {
    /// Network element id for this process
    #[arg(long, default_value = "ne-demo")]
    neid: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Local round-trip: post to an in-process mailbox through the lookup
    /// service and watch a timer tick
    Local,
    /// Run a distributed (TCP) mailbox and print what arrives
    Serve {
        #[arg(long, default_value = "demo")]
        name: String,
        #[arg(long, default_value = "127.0.0.1:7777")]
        endpoint: SocketAddrV4,
    },
    /// Post one line to a remote distributed mailbox
    Send {
        #[arg(long, default_value = "demo")]
        name: String,
        #[arg(long, default_value = "127.0.0.1:7777")]
        endpoint: SocketAddrV4,
        #[arg(long, default_value = "hello from postbus")]
        text: String,
    },
    /// Join a multicast group and print what arrives
    GroupListen {
        #[arg(long, default_value = "demo-group")]
        name: String,
        #[arg(long, default_value = "224.9.9.1:7878")]
        endpoint: SocketAddrV4,
    },
    /// Post one line to a multicast group
    GroupSend {
        #[arg(long, default_value = "demo-group")]
        name: String,
        #[arg(long, default_value = "224.9.9.1:7878")]
        endpoint: SocketAddrV4,
        #[arg(long, default_value = "hello group")]
        text: String,
    },
}

fn handlers() -> Arc<MessageHandlerList> {
    let handlers = MessageHandlerList::new();
    handlers.add(
        TEXT_MESSAGE_ID,
        Arc::new(|message| {
            if let Some(text) = message.as_any().downcast_ref::<TextMessage>() {
                info!("received: {}", text.text);
            }
            0
        }),
    );
    handlers
}

async fn run_local(fabric: Arc<Fabric>) -> Result<()> {
    let owner = LocalMailbox::create(&fabric, "demo-local");
    owner.activate().await?;

    let handle = fabric.find(&MailboxAddress::local("demo-local")).await?;
    handle.post(Box::new(TextMessage::new("posted through the MLS"))).await?;

    let timer = TimerMessage::new(0x0011, Duration::from_millis(200), Duration::ZERO);
    owner.schedule_timer(timer).await?;

    for _ in 0..2 {
        match owner.get_message(Some(Duration::from_secs(1))).await {
            Some(message) => match message.as_any().downcast_ref::<TextMessage>() {
                Some(text) => info!("dequeued: {}", text.text),
                None => info!("dequeued message id {:#06x}", message.message_id()),
            },
            None => warn!("queue went quiet early"),
        }
    }
    owner.deactivate().await?;
    Ok(())
}

async fn run_receiver(fabric: Arc<Fabric>, owner: postbus::MailboxOwnerHandle) -> Result<()> {
    owner.activate().await?;
    info!("receiving on {} (ctrl-c to stop)", owner.address());
    let processor = MailboxProcessor::new(handlers(), owner);
    processor.process_mailbox(1, fabric.thread_manager()).await
}

async fn run_sender(fabric: Arc<Fabric>, address: MailboxAddress, text: &str) -> Result<()> {
    let handle = fabric.find(&address).await?;
    handle.post(Box::new(TextMessage::new(text))).await?;
    info!("posted to {}", address);
    // Give the datagram/stream a moment to flush before teardown
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "postbus=debug".into()),
        )
        .init();

    let args = Args::parse();
    let config = FabricConfig { neid: args.neid.clone(), ..Default::default() };
    let fabric = Fabric::new(config)?;
    fabric.message_factory().register_creator(
        TEXT_MESSAGE_ID,
        Arc::new(|buffer| TextMessage::deserialize(buffer).map(|m| Box::new(m) as _)),
    );

    let outcome = match args.command {
        Command::Local => run_local(Arc::clone(&fabric)).await,
        Command::Serve { name, endpoint } => {
            let owner = DistributedMailbox::create(
                &fabric,
                &name,
                endpoint,
                DistributedMailboxConfig::default(),
            );
            run_receiver(Arc::clone(&fabric), owner).await
        }
        Command::Send { name, endpoint, text } => {
            run_sender(
                Arc::clone(&fabric),
                MailboxAddress::distributed(&name, endpoint),
                &text,
            )
            .await
        }
        Command::GroupListen { name, endpoint } => {
            let owner =
                GroupMailbox::create(&fabric, &name, endpoint, GroupMailboxConfig::default());
            run_receiver(Arc::clone(&fabric), owner).await
        }
        Command::GroupSend { name, endpoint, text } => {
            run_sender(
                Arc::clone(&fabric),
                MailboxAddress::group(&name, endpoint),
                &text,
            )
            .await
        }
    };

    fabric.shutdown().await;
    outcome
}
