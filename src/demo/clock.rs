//! Clock demo
//!
//! The server world tracks the time of day and broadcasts it once per tick.
//! Clients can switch between 24 and 12 hour display and change the tick
//! rate.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, BufReader};

use swiftsocket::protocol::{CodecResult, Decode, Decoder, Encode, Encoder};
use swiftsocket::{
    Client, ConnectionContext, Executable, FrameRate, NetworkConfig, Server, WorldClient,
    WorldContext, WorldServer,
};

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Client -> server: toggle 12/24 hour display
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SwitchFormat;

/// Client -> server: change the tick rate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SetFps {
    pub frames_per_second: f64,
}

/// Server -> client: the formatted time
#[derive(Debug, Clone, PartialEq)]
pub struct TimeUpdate {
    pub time: String,
}

impl Encode for SwitchFormat {
    fn encode(&self, _enc: &mut Encoder) -> CodecResult<()> {
        Ok(())
    }
}

impl Decode for SwitchFormat {
    fn decode(_dec: &mut Decoder<'_>) -> CodecResult<Self> {
        Ok(SwitchFormat)
    }
}

impl Encode for SetFps {
    fn encode(&self, enc: &mut Encoder) -> CodecResult<()> {
        enc.put(&self.frames_per_second)
    }
}

impl Decode for SetFps {
    fn decode(dec: &mut Decoder<'_>) -> CodecResult<Self> {
        Ok(Self {
            frames_per_second: dec.get()?,
        })
    }
}

impl Encode for TimeUpdate {
    fn encode(&self, enc: &mut Encoder) -> CodecResult<()> {
        enc.put(&self.time)
    }
}

impl Decode for TimeUpdate {
    fn decode(dec: &mut Decoder<'_>) -> CodecResult<Self> {
        Ok(Self { time: dec.get()? })
    }
}

/// Format seconds since midnight as `HH:MM:SS` or `hh:MM:SS AM`
pub fn format_time(seconds_of_day: u64, twenty_four_hour: bool) -> String {
    let seconds_of_day = seconds_of_day % SECONDS_PER_DAY;
    let hours = seconds_of_day / 3600;
    let minutes = (seconds_of_day / 60) % 60;
    let seconds = seconds_of_day % 60;

    if twenty_four_hour {
        return format!("{:02}:{:02}:{:02}", hours, minutes, seconds);
    }

    let suffix = if hours < 12 { "AM" } else { "PM" };
    let hours = match hours % 12 {
        0 => 12,
        h => h,
    };
    format!("{:02}:{:02}:{:02} {}", hours, minutes, seconds, suffix)
}

/// Server-side clock state
#[derive(Debug)]
pub struct ClockWorld {
    twenty_four_hour: bool,
    seconds_of_day: f64,
    frame_rate: Option<FrameRate>,
}

impl ClockWorld {
    pub fn new() -> Self {
        Self {
            twenty_four_hour: true,
            seconds_of_day: 0.0,
            frame_rate: None,
        }
    }

    /// Let `SetFps` requests adjust `frame_rate`
    pub fn with_frame_rate(mut self, frame_rate: FrameRate) -> Self {
        self.frame_rate = Some(frame_rate);
        self
    }

    pub fn twenty_four_hour(&self) -> bool {
        self.twenty_four_hour
    }

    pub fn current(&self) -> TimeUpdate {
        TimeUpdate {
            time: format_time(self.seconds_of_day as u64, self.twenty_four_hour),
        }
    }
}

impl Default for ClockWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl WorldContext for ClockWorld {
    fn init(&mut self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        self.seconds_of_day = (now % SECONDS_PER_DAY) as f64;
    }

    fn advance(&mut self, delta_seconds: f64) {
        self.seconds_of_day = (self.seconds_of_day + delta_seconds) % SECONDS_PER_DAY as f64;
    }
}

/// Messages the clock server understands
#[derive(Debug)]
pub enum ClockRequest {
    SwitchFormat(SwitchFormat),
    SetFps(SetFps),
}

impl From<SwitchFormat> for ClockRequest {
    fn from(request: SwitchFormat) -> Self {
        ClockRequest::SwitchFormat(request)
    }
}

impl From<SetFps> for ClockRequest {
    fn from(request: SetFps) -> Self {
        ClockRequest::SetFps(request)
    }
}

impl Executable<ClockWorld> for ClockRequest {
    fn execute(self, origin: &Arc<ConnectionContext>, world: &mut ClockWorld) -> anyhow::Result<()> {
        match self {
            ClockRequest::SwitchFormat(_) => {
                world.twenty_four_hour = !world.twenty_four_hour;
                tracing::info!(
                    "{} switched to {} hour display",
                    origin.peer_addr(),
                    if world.twenty_four_hour { 24 } else { 12 }
                );
            }
            ClockRequest::SetFps(SetFps { frames_per_second }) => {
                let rate = world
                    .frame_rate
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("frame rate is fixed"))?;
                anyhow::ensure!(
                    rate.set(frames_per_second),
                    "invalid frame rate {}",
                    frames_per_second
                );
            }
        }
        Ok(())
    }
}

/// Client-side display
#[derive(Debug, Default)]
pub struct ClockDisplay {
    pub last: Option<String>,
}

impl WorldContext for ClockDisplay {
    fn advance(&mut self, _delta_seconds: f64) {}
}

/// Messages the clock client understands
#[derive(Debug)]
pub enum ClockEvent {
    Time(TimeUpdate),
}

impl From<TimeUpdate> for ClockEvent {
    fn from(update: TimeUpdate) -> Self {
        ClockEvent::Time(update)
    }
}

impl Executable<ClockDisplay> for ClockEvent {
    fn execute(self, _origin: &Arc<ConnectionContext>, display: &mut ClockDisplay) -> anyhow::Result<()> {
        let ClockEvent::Time(update) = self;
        println!("{}", update.time);
        display.last = Some(update.time);
        Ok(())
    }
}

/// Tick the clock and broadcast the time until Ctrl+C
pub async fn run_server(config: NetworkConfig, frames_per_second: f64) -> anyhow::Result<()> {
    let server: Server<ClockRequest> = Server::new(config);
    server.register_inbound_type::<SwitchFormat>(1)?;
    server.register_inbound_type::<SetFps>(2)?;
    server.register_outbound::<TimeUpdate>(1)?;

    let frame_rate = FrameRate::new(frames_per_second);
    let clock = ClockWorld::new().with_frame_rate(frame_rate.clone());
    let world = WorldServer::with_frame_rate(server.clone(), clock, frame_rate);

    let addr = world.start().await?;
    println!("Clock server listening on {} ({})", addr, server.transport_kind());
    println!("Press Ctrl+C to stop.\n");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    while server.is_running() {
        tokio::select! {
            _ = world.tick() => {
                let update = world.world().lock().await.current();
                let reached = server.broadcast(&update).await?;
                tracing::debug!("{} sent to {} client(s)", update.time, reached);
            }
            _ = &mut shutdown => {
                println!("\nShutting down...");
                server.stop().await?;
            }
        }
    }

    Ok(())
}

/// Print the time; `f` switches format, `fps N` changes the rate
pub async fn run_client(config: NetworkConfig, server_addr: SocketAddr) -> anyhow::Result<()> {
    let client: Client<ClockEvent> = Client::new(config);
    client.register_outbound::<SwitchFormat>(1)?;
    client.register_outbound::<SetFps>(2)?;
    client.register_inbound_type::<TimeUpdate>(1)?;

    let world = WorldClient::new(client.clone(), ClockDisplay::default());

    println!("Commands: f (switch format), fps <n> (set rate), q (quit)\n");

    let commands = tokio::spawn(read_commands(client.clone()));

    tokio::select! {
        result = world.run(server_addr) => result?,
        _ = tokio::signal::ctrl_c() => {}
    }

    commands.abort();
    if client.is_running() {
        client.stop().await?;
    }
    Ok(())
}

async fn read_commands(client: Client<ClockEvent>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let mut words = line.split_whitespace();
        match (words.next(), words.next()) {
            (Some("f"), None) => client.send(&SwitchFormat).await?,
            (Some("fps"), Some(value)) => match value.parse::<f64>() {
                Ok(frames_per_second) => client.send(&SetFps { frames_per_second }).await?,
                Err(_) => println!("Not a number: {}", value),
            },
            (Some("q"), None) => {
                client.stop().await?;
                break;
            }
            (None, _) => {}
            _ => println!("Unknown command: {}", line.trim()),
        }
    }

    Ok(())
}
