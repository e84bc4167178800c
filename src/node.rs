//! Session node
//!
//! Decides whether this process manages the session or follows an existing
//! manager, then wires the console into the right hub:
//!
//! - Manager: relay server + discovery responder + console on a shared hub
//! - Follower: console and an upstream socket bridged by a local hub
//!
//! A fresh manager runs one settle check: after a random delay it probes
//! again, collects every answer, and yields to the lowest rival address if it
//! sorts below its own. Yielding closes its followers with a session-moved
//! notice; they, and a node whose winner cannot be reached, go back through
//! discovery instead of exiting. The console keeps running across rejoins.

use std::fmt;
use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::discovery::{discover, discover_lowest, primary_ipv4, PeerAddress, ProbeOptions, Responder};
use crate::error::Result;
use crate::relay::{
    connect_upstream, serve_endpoint, Departure, Endpoint, RelayHub, RelayServer, UpstreamSocket,
};
use crate::session::SessionName;

/// How long a follower keeps retrying its first connection to the manager
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Unreachable managers in a row before giving up
const MAX_CONNECT_FAILURES: u32 = 3;

type PumpHandle = JoinHandle<Result<Departure>>;

// ─────────────────────────────────────────────────────────────────
// Options
// ─────────────────────────────────────────────────────────────────

/// Random delay range before the settle check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettleWindow {
    pub min: Duration,
    pub max: Duration,
}

impl SettleWindow {
    fn pick(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        rand::thread_rng().gen_range(self.min..=self.max)
    }
}

/// Everything a node needs to join a session
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub session: SessionName,

    /// Address the relay server binds when managing
    pub relay_bind: IpAddr,

    /// Relay server port (0 lets the OS pick)
    pub relay_port: u16,

    /// Outbound queue depth per endpoint
    pub queue_capacity: usize,

    /// How long a broadcast waits on one full queue
    pub send_timeout: Duration,

    /// Where the responder listens when managing; normally `probe.group`
    pub responder_group: SocketAddrV4,

    pub probe: ProbeOptions,

    /// `None` disables the settle check
    pub settle: Option<SettleWindow>,

    pub connect_timeout: Duration,

    /// Print role and shutdown status lines on stderr
    pub announce: bool,
}

/// Role picked by discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Manager,
    Follower(PeerAddress),
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Manager => f.write_str("manager"),
            Role::Follower(manager) => write!(f, "follower of {}", manager),
        }
    }
}

/// Why a node stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// The local console reached end of input
    ConsoleClosed,

    /// The manager this node followed went away
    ManagerGone,
}

/// Local console, before or after its pump is started
enum Console<C> {
    Idle(C),
    Running(PumpHandle),
}

impl<C: Endpoint + 'static> Console<C> {
    fn start(self, hub: &Arc<RelayHub>) -> PumpHandle {
        match self {
            Console::Idle(endpoint) => tokio::spawn(serve_endpoint(Arc::clone(hub), endpoint)),
            Console::Running(task) => task,
        }
    }
}

/// Outcome of one role
enum Step<C> {
    Done(Exit),
    Rejoin(Console<C>),
}

// ─────────────────────────────────────────────────────────────────
// Node
// ─────────────────────────────────────────────────────────────────

pub struct Node {
    options: NodeOptions,
    hub: Arc<RelayHub>,
}

impl Node {
    pub fn new(options: NodeOptions) -> Self {
        let hub = RelayHub::new(options.session.clone(), options.queue_capacity)
            .with_send_timeout(options.send_timeout);
        Self {
            options,
            hub: Arc::new(hub),
        }
    }

    pub fn session(&self) -> &SessionName {
        &self.options.session
    }

    pub fn hub(&self) -> &Arc<RelayHub> {
        &self.hub
    }

    /// Probe for an existing manager
    pub async fn elect(&self) -> Result<Role> {
        let role = match discover(&self.options.session, &self.options.probe).await? {
            Some(manager) => Role::Follower(manager),
            None => Role::Manager,
        };
        info!(session = %self.options.session, role = %role, "Role selected");
        Ok(role)
    }

    /// Join the session with `console` as the local endpoint
    ///
    /// Runs until the console ends or, as a follower, until the manager goes
    /// away. A manager handing the session off, or one that cannot be
    /// reached, sends the node back through discovery. Configuration
    /// failures (address, bind) are returned, as is the last connect error
    /// after repeated unreachable managers.
    pub async fn run<C>(self, console: C) -> Result<Exit>
    where
        C: Endpoint + 'static,
    {
        let mut console = Console::Idle(console);
        let mut connect_failures = 0u32;

        loop {
            let step = match self.elect().await? {
                Role::Manager => self.manage(console).await?,
                Role::Follower(manager) => {
                    match connect_upstream(manager, &self.options.session, self.options.connect_timeout).await {
                        Ok(upstream) => {
                            connect_failures = 0;
                            self.follow(console, manager, upstream).await?
                        }
                        Err(e) => {
                            connect_failures += 1;
                            if connect_failures >= MAX_CONNECT_FAILURES {
                                return Err(e);
                            }
                            warn!(manager = %manager, attempt = connect_failures, error = %e, "Manager unreachable, rejoining");
                            Step::Rejoin(console)
                        }
                    }
                }
            };

            match step {
                Step::Done(exit) => return Ok(exit),
                Step::Rejoin(next) => console = next,
            }
        }
    }

    async fn manage<C>(&self, console: Console<C>) -> Result<Step<C>>
    where
        C: Endpoint + 'static,
    {
        let probe = &self.options.probe;
        let local_ip = primary_ipv4(probe.group, probe.interface)?;
        let server = RelayServer::bind(
            SocketAddr::new(self.options.relay_bind, self.options.relay_port),
            Arc::clone(&self.hub),
        )
        .await?;
        let advertise = PeerAddress::new(SocketAddr::new(IpAddr::V4(local_ip), server.local_addr()?.port()));
        let responder = Responder::bind(
            self.options.session.clone(),
            self.options.responder_group,
            probe.interface,
            advertise,
        )?;

        let server_task = server.spawn();
        let responder_task = responder.spawn();
        let mut console_task = console.start(&self.hub);
        self.status(format!("Running xcp server [{}]...", self.options.session));
        info!(session = %self.options.session, advertise = %advertise, "Managing session");

        let settle = self.settle_check(advertise);
        tokio::pin!(settle);
        let mut settled = self.options.settle.is_none();

        loop {
            tokio::select! {
                joined = &mut console_task => {
                    log_pump_exit("console", joined);
                    let stats = self.hub.stats();
                    info!(
                        session = %self.options.session,
                        attached = stats.attached,
                        broadcasts = stats.broadcasts,
                        deliveries = stats.deliveries,
                        delivery_failures = stats.delivery_failures,
                        "Closing session"
                    );
                    self.hub.close_all();
                    server_task.abort();
                    responder_task.abort();
                    return Ok(Step::Done(Exit::ConsoleClosed));
                }

                winner = &mut settle, if !settled => {
                    settled = true;
                    if let Some(winner) = winner {
                        server_task.abort();
                        responder_task.abort();
                        let moved = self.hub.detach_remote();
                        warn!(
                            session = %self.options.session,
                            winner = %winner,
                            moved = moved.len(),
                            "Yielding session to another manager"
                        );
                        return match connect_upstream(winner, &self.options.session, self.options.connect_timeout).await {
                            Ok(upstream) => self.follow(Console::Running(console_task), winner, upstream).await,
                            Err(e) => {
                                warn!(winner = %winner, error = %e, "Winner unreachable, rejoining");
                                Ok(Step::Rejoin(Console::Running(console_task)))
                            }
                        };
                    }
                }
            }
        }
    }

    async fn follow<C>(&self, console: Console<C>, manager: PeerAddress, upstream: UpstreamSocket) -> Result<Step<C>>
    where
        C: Endpoint + 'static,
    {
        let mut console_task = console.start(&self.hub);
        let mut upstream_task = tokio::spawn(serve_endpoint(Arc::clone(&self.hub), upstream));
        self.status(format!("Running xcp client [{}]...", self.options.session));
        info!(session = %self.options.session, manager = %manager, "Following manager");

        tokio::select! {
            joined = &mut console_task => {
                log_pump_exit("console", joined);
                // Dropping the upstream handle lets its pump send a close frame
                self.hub.close_all();
                let _ = tokio::time::timeout(Duration::from_secs(1), &mut upstream_task).await;
                Ok(Step::Done(Exit::ConsoleClosed))
            }

            joined = &mut upstream_task => {
                let moved = matches!(joined, Ok(Ok(Departure::SessionMoved)));
                log_pump_exit("upstream", joined);
                if moved {
                    info!(session = %self.options.session, manager = %manager, "Manager handed the session off, rejoining");
                    return Ok(Step::Rejoin(Console::Running(console_task)));
                }
                self.hub.close_all();
                console_task.abort();
                self.status(format!("Connection to the xcp server [{}] closed.", self.options.session));
                Ok(Step::Done(Exit::ManagerGone))
            }
        }
    }

    /// Operator-facing status line; stdout is reserved for relayed text
    fn status(&self, line: String) {
        if self.options.announce {
            eprintln!("{}", line);
        }
    }

    /// One delayed probe for competing managers; `Some` means yield to it
    async fn settle_check(&self, advertise: PeerAddress) -> Option<PeerAddress> {
        let window = self.options.settle?;
        let delay = window.pick();
        debug!(delay_ms = delay.as_millis() as u64, "Settle check scheduled");
        tokio::time::sleep(delay).await;

        let mut probe = self.options.probe.clone();
        probe.ignore = Some(advertise);
        match discover_lowest(&self.options.session, &probe).await {
            Ok(rival) => {
                let yield_to = should_yield(advertise, rival);
                if let (Some(rival), None) = (rival, yield_to) {
                    info!(rival = %rival, "Rival manager will yield, keeping session");
                }
                yield_to
            }
            Err(e) => {
                warn!(error = %e, "Settle check failed, keeping session");
                None
            }
        }
    }
}

/// Lowest address keeps the session
fn should_yield(own: PeerAddress, rival: Option<PeerAddress>) -> Option<PeerAddress> {
    rival.filter(|rival| *rival < own)
}

fn log_pump_exit(name: &str, joined: std::result::Result<Result<Departure>, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(departure)) => debug!(endpoint = name, departure = ?departure, "Pump finished"),
        Ok(Err(e)) => debug!(endpoint = name, error = %e, "Pump finished with error"),
        Err(e) => warn!(endpoint = name, error = %e, "Pump task failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{ProbeMessage, ResponseMessage, MAX_DATAGRAM_SIZE};
    use crate::relay::endpoint::testing::{ChannelEndpoint, ChannelPeer};
    use crate::relay::console::ConsoleEndpoint;
    use crate::relay::endpoint::EndpointKind;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncWriteExt, BufReader};

    fn free_udp_port() -> u16 {
        std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn options(name: &str, group_port: u16) -> NodeOptions {
        options_on(name, Ipv4Addr::LOCALHOST, SocketAddrV4::new(Ipv4Addr::LOCALHOST, group_port))
    }

    /// Node living on `ip` that probes and answers on `group`
    fn options_on(name: &str, ip: Ipv4Addr, group: SocketAddrV4) -> NodeOptions {
        let mut probe = ProbeOptions::new(group, Duration::from_millis(300));
        probe.interface = Some(ip);
        NodeOptions {
            session: SessionName::new(name).unwrap(),
            relay_bind: IpAddr::V4(ip),
            relay_port: 0,
            queue_capacity: 64,
            send_timeout: Duration::from_secs(5),
            responder_group: group,
            probe,
            settle: None,
            connect_timeout: Duration::from_secs(2),
            announce: false,
        }
    }

    async fn wait_until(what: &str, check: impl Fn() -> bool) {
        for _ in 0..300 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    /// Start a manager with a channel console; returns once it is serving
    async fn start_manager(opts: NodeOptions) -> (Arc<RelayHub>, ChannelPeer, JoinHandle<Result<Exit>>) {
        let (console, peer) = ChannelEndpoint::new(EndpointKind::Console);
        let node = Node::new(opts);
        let hub = Arc::clone(node.hub());
        let task = tokio::spawn(node.run(console));
        wait_until("manager console", || hub.len() == 1).await;
        (hub, peer, task)
    }

    #[test]
    fn test_lowest_address_wins() {
        let own: PeerAddress = "10.0.0.5:2975".parse().unwrap();
        let lower: PeerAddress = "10.0.0.2:2975".parse().unwrap();
        let higher: PeerAddress = "10.0.0.9:2975".parse().unwrap();

        assert_eq!(should_yield(own, Some(lower)), Some(lower));
        assert_eq!(should_yield(own, Some(higher)), None);
        assert_eq!(should_yield(own, None), None);
    }

    #[test]
    fn test_settle_window_pick() {
        let window = SettleWindow {
            min: Duration::from_millis(250),
            max: Duration::from_millis(1000),
        };
        for _ in 0..50 {
            let d = window.pick();
            assert!(d >= window.min && d <= window.max);
        }

        let fixed = SettleWindow {
            min: Duration::from_millis(100),
            max: Duration::from_millis(100),
        };
        assert_eq!(fixed.pick(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_elect_manager_when_nobody_answers() {
        let node = Node::new(options("room1", free_udp_port()));
        assert_eq!(node.elect().await.unwrap(), Role::Manager);
    }

    #[tokio::test]
    async fn test_two_nodes_relay_without_echo() {
        let group_port = free_udp_port();
        let (hub_a, mut peer_a, _a_task) = start_manager(options("room1", group_port)).await;

        let (console_b, mut peer_b) = ChannelEndpoint::new(EndpointKind::Console);
        let node_b = Node::new(options("room1", group_port));
        assert!(matches!(node_b.elect().await.unwrap(), Role::Follower(_)));
        let hub_b = Arc::clone(node_b.hub());
        let b_task = tokio::spawn(node_b.run(console_b));

        wait_until("follower attached", || hub_a.len() == 2 && hub_b.len() == 2).await;

        peer_a.input.send("hello\n".to_string()).unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), peer_b.output.recv()).await.unwrap();
        assert_eq!(got.as_deref(), Some("hello\n"));

        peer_b.input.send("world\n".to_string()).unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), peer_a.output.recv()).await.unwrap();
        assert_eq!(got.as_deref(), Some("world\n"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(peer_a.output.try_recv().is_err());
        assert!(peer_b.output.try_recv().is_err());

        // Follower console closing ends the follower only
        drop(peer_b.input);
        let exit = tokio::time::timeout(Duration::from_secs(3), b_task).await.unwrap().unwrap().unwrap();
        assert_eq!(exit, Exit::ConsoleClosed);
    }

    #[tokio::test]
    async fn test_follower_exits_when_manager_closes() {
        let group_port = free_udp_port();
        let (hub_a, peer_a, a_task) = start_manager(options("room2", group_port)).await;

        let (console_b, _peer_b) = ChannelEndpoint::new(EndpointKind::Console);
        let node_b = Node::new(options("room2", group_port));
        let b_task = tokio::spawn(node_b.run(console_b));
        wait_until("follower attached", || hub_a.len() == 2).await;

        drop(peer_a.input);
        let exit_a = tokio::time::timeout(Duration::from_secs(3), a_task).await.unwrap().unwrap().unwrap();
        assert_eq!(exit_a, Exit::ConsoleClosed);

        let exit_b = tokio::time::timeout(Duration::from_secs(3), b_task).await.unwrap().unwrap().unwrap();
        assert_eq!(exit_b, Exit::ManagerGone);
    }

    #[tokio::test]
    async fn test_large_paste_reaches_follower_in_order() {
        let group_port = free_udp_port();
        let (hub_a, peer_a, _a_task) = start_manager(options("paste", group_port)).await;

        let (console_b, mut peer_b) = ChannelEndpoint::new(EndpointKind::Console);
        let node_b = Node::new(options("paste", group_port));
        let hub_b = Arc::clone(node_b.hub());
        let _b_task = tokio::spawn(node_b.run(console_b));
        wait_until("follower attached", || hub_a.len() == 2 && hub_b.len() == 2).await;

        const LINES: usize = 5000;
        for i in 0..LINES {
            peer_a.input.send(format!("line {}\n", i)).unwrap();
        }

        let received = tokio::time::timeout(Duration::from_secs(30), async {
            let mut received = Vec::with_capacity(LINES);
            while received.len() < LINES {
                match peer_b.output.recv().await {
                    Some(line) => received.push(line),
                    None => break,
                }
            }
            received
        })
        .await
        .unwrap();

        assert_eq!(received.len(), LINES);
        for (i, line) in received.iter().enumerate() {
            assert_eq!(line, &format!("line {}\n", i));
        }
        assert_eq!(hub_a.len(), 2);
        assert_eq!(hub_a.stats().delivery_failures, 0);
    }

    #[tokio::test]
    async fn test_non_utf8_console_line_keeps_session_up() {
        let group_port = free_udp_port();
        let (mut typed, console_in) = tokio::io::duplex(1024);
        let console_a = ConsoleEndpoint::new(BufReader::new(console_in), tokio::io::sink());
        let node_a = Node::new(options("latin1", group_port));
        let hub_a = Arc::clone(node_a.hub());
        let a_task = tokio::spawn(node_a.run(console_a));
        wait_until("manager console", || hub_a.len() == 1).await;

        let (console_b, mut peer_b) = ChannelEndpoint::new(EndpointKind::Console);
        let node_b = Node::new(options("latin1", group_port));
        let b_task = tokio::spawn(node_b.run(console_b));
        wait_until("follower attached", || hub_a.len() == 2).await;

        typed.write_all(b"caf\xe9\n").await.unwrap();
        typed.write_all(b"still here\n").await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), peer_b.output.recv()).await.unwrap();
        assert_eq!(first.as_deref(), Some("caf\u{fffd}\n"));
        let second = tokio::time::timeout(Duration::from_secs(2), peer_b.output.recv()).await.unwrap();
        assert_eq!(second.as_deref(), Some("still here\n"));

        assert!(!a_task.is_finished());
        assert!(!b_task.is_finished());
        assert_eq!(hub_a.len(), 2);
    }

    #[tokio::test]
    async fn test_handed_off_follower_rejoins() {
        let group_port = free_udp_port();
        let (hub_a, _peer_a, _a_task) = start_manager(options("moving", group_port)).await;

        let (console_b, _peer_b) = ChannelEndpoint::new(EndpointKind::Console);
        let node_b = Node::new(options("moving", group_port));
        let hub_b = Arc::clone(node_b.hub());
        let b_task = tokio::spawn(node_b.run(console_b));
        wait_until("follower attached", || hub_a.count_kind(EndpointKind::Follower) == 1).await;

        assert_eq!(hub_a.detach_remote().len(), 1);

        // Back through discovery and onto whoever answers, without exiting
        wait_until("follower reattached", || hub_a.count_kind(EndpointKind::Follower) == 1).await;
        wait_until("upstream restored", || hub_b.count_kind(EndpointKind::Upstream) == 1).await;
        assert_eq!(hub_b.count_kind(EndpointKind::Console), 1);
        assert!(!b_task.is_finished());
    }

    #[tokio::test]
    async fn test_unreachable_manager_leads_to_managing() {
        let group_port = free_udp_port();
        let group = SocketAddrV4::new(Ipv4Addr::LOCALHOST, group_port);

        // A stale answer pointing at a port nobody listens on
        let dead = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let stale = tokio::net::UdpSocket::bind(group).await.unwrap();
        let answered = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            let (n, _) = stale.recv_from(&mut buf).await.unwrap();
            let asked = ProbeMessage::parse(&buf[..n]).unwrap();
            let reply = ResponseMessage { manager: PeerAddress::new(dead) };
            stale.send_to(reply.encode().as_bytes(), asked.reply_to).await.unwrap();
        });

        let mut opts = options("stale", group_port);
        opts.connect_timeout = Duration::from_millis(200);
        let (console, _peer) = ChannelEndpoint::new(EndpointKind::Console);
        let node = Node::new(opts);
        let hub = Arc::clone(node.hub());
        let task = tokio::spawn(node.run(console));
        answered.await.unwrap();

        wait_until("node managing", || hub.len() == 1).await;
        let session = SessionName::new("stale").unwrap();
        let mut ask = ProbeOptions::new(group, Duration::from_secs(1));
        ask.interface = Some(Ipv4Addr::LOCALHOST);
        let mut found = None;
        for _ in 0..10 {
            found = discover(&session, &ask).await.unwrap();
            if found.is_some() {
                break;
            }
        }
        assert!(found.is_some());
        assert!(!task.is_finished());
    }

    #[tokio::test]
    async fn test_higher_manager_yields_and_follows() {
        let low_ip = Ipv4Addr::new(127, 0, 0, 1);
        let high_ip = Ipv4Addr::new(127, 0, 0, 2);
        let low_group = SocketAddrV4::new(low_ip, free_udp_port());
        let high_group = SocketAddrV4::new(high_ip, free_udp_port());

        // The higher node asks where the lower one will answer, but answers elsewhere,
        // so both end up managing before the settle check runs
        let mut high = options_on("split", high_ip, low_group);
        high.responder_group = high_group;
        high.settle = Some(SettleWindow {
            min: Duration::from_millis(900),
            max: Duration::from_millis(900),
        });
        let (hub_high, mut peer_high, high_task) = start_manager(high).await;

        let (hub_low, mut peer_low, _low_task) = start_manager(options_on("split", low_ip, low_group)).await;
        assert_eq!(hub_low.count_kind(EndpointKind::Follower), 0);

        wait_until("higher node following", || {
            hub_high.count_kind(EndpointKind::Upstream) == 1 && hub_low.count_kind(EndpointKind::Follower) == 1
        })
        .await;
        assert_eq!(hub_high.len(), 2);
        assert_eq!(hub_high.count_kind(EndpointKind::Console), 1);
        assert!(!high_task.is_finished());

        // Its own relay and responder are gone
        let mut ask = ProbeOptions::new(high_group, Duration::from_millis(200));
        ask.interface = Some(low_ip);
        assert!(discover(&SessionName::new("split").unwrap(), &ask).await.unwrap().is_none());

        peer_low.input.send("from low\n".to_string()).unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), peer_high.output.recv()).await.unwrap();
        assert_eq!(got.as_deref(), Some("from low\n"));

        peer_high.input.send("from high\n".to_string()).unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), peer_low.output.recv()).await.unwrap();
        assert_eq!(got.as_deref(), Some("from high\n"));
    }
}
