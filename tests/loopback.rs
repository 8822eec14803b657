use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rstest::{fixture, rstest};
use stonenet::{
    setup_local_tracing, AppError, AppResult, Client, ClientConfig, ClientService,
    HeartbeatAction, HeartbeatService, LineCodec, Listener, ReconnectService, Server,
    ServerConfig, Session, SessionListener, SessionManager, SessionWrapper, Status, Transport,
};

#[fixture]
#[once]
fn setup() {
    setup_local_tracing().expect("failed to setup tracing");
}

#[derive(Clone, Copy)]
enum Reply {
    Nothing,
    Echo,
    Pong,
}

struct Recorder {
    reply: Reply,
    delay: Duration,
    events: Mutex<Vec<String>>,
    messages: Mutex<Vec<String>>,
    callback_threads: Mutex<Vec<String>>,
}

#[derive(Clone)]
struct Probe(Arc<Recorder>);

impl Probe {
    fn new(reply: Reply) -> Probe {
        Probe::slow(reply, Duration::ZERO)
    }

    /// Each message callback sleeps `delay` before replying.
    fn slow(reply: Reply, delay: Duration) -> Probe {
        Probe(Arc::new(Recorder {
            reply,
            delay,
            events: Mutex::new(Vec::new()),
            messages: Mutex::new(Vec::new()),
            callback_threads: Mutex::new(Vec::new()),
        }))
    }

    fn callback_threads(&self) -> Vec<String> {
        self.0.callback_threads.lock().clone()
    }

    fn record_thread(&self) {
        let name = thread::current().name().unwrap_or("unnamed").to_string();
        self.0.callback_threads.lock().push(name);
    }

    fn messages(&self) -> Vec<String> {
        self.0.messages.lock().clone()
    }

    fn events(&self) -> Vec<String> {
        self.0.events.lock().clone()
    }

    fn count(&self, event: &str) -> usize {
        self.0.events.lock().iter().filter(|e| *e == event).count()
    }

    fn record(&self, event: &str) {
        self.0.events.lock().push(event.to_string());
    }
}

impl Listener<String> for Probe {
    fn on_session_registered(&self, _: &Arc<Session<String>>) -> AppResult<()> {
        self.record("registered");
        Ok(())
    }

    fn on_session_connected(&self, _: &Arc<Session<String>>) -> AppResult<()> {
        self.record("connected");
        Ok(())
    }

    fn on_before_session_closed(&self, _: &Arc<Session<String>>) -> AppResult<()> {
        self.record("before-close");
        Ok(())
    }

    fn on_after_session_closed(&self, _: &Arc<Session<String>>) -> AppResult<()> {
        self.record("after-close");
        Ok(())
    }

    fn on_message_received(&self, message: String, session: &Arc<Session<String>>) -> AppResult<()> {
        self.record_thread();
        if !self.0.delay.is_zero() {
            thread::sleep(self.0.delay);
        }
        self.0.messages.lock().push(message.clone());
        match self.0.reply {
            Reply::Nothing => Ok(()),
            Reply::Echo => session.send(&message),
            Reply::Pong if message == "PING" => session.send(&"PONG".to_string()),
            Reply::Pong => Ok(()),
        }
    }

    fn on_exception_caught(
        &self,
        _: &AppError,
        session: Option<&Arc<Session<String>>>,
    ) -> AppResult<()> {
        self.record_thread();
        self.record("exception");
        if let Some(session) = session {
            self.record(&format!("exception-status:{:?}", session.status()));
        }
        Ok(())
    }
}

fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

fn server_config(transport: Transport) -> ServerConfig {
    ServerConfig {
        name: "test-server".to_string(),
        host: "127.0.0.1".to_string(),
        port: 0,
        transport,
        executor_count: 2,
        select_timeout_ms: 50,
        ..Default::default()
    }
}

fn client_config(port: u16, transport: Transport) -> ClientConfig {
    ClientConfig {
        name: "test-client".to_string(),
        remote_host: "127.0.0.1".to_string(),
        port,
        transport,
        executor_count: 2,
        connection_timeout_ms: 2_000,
        select_timeout_ms: 50,
        ..Default::default()
    }
}

fn start_server(config: ServerConfig, probe: &Probe) -> (Server<String>, u16) {
    let server = Server::new(config, LineCodec::new(), probe.clone()).unwrap();
    server.start().unwrap();
    let port = server.local_addr().unwrap().port();
    (server, port)
}

fn assert_off_reactor(threads: &[String]) {
    assert!(!threads.is_empty());
    for name in threads {
        assert!(!name.contains("processor"), "callback on reactor thread: {:?}", threads);
    }
}

fn connect_client(port: u16, transport: Transport, probe: &Probe) -> Client<String> {
    let client = Client::new(client_config(port, transport), LineCodec::new(), probe.clone()).unwrap();
    client.connect().unwrap();
    client
}

#[rstest]
fn ping_pong_and_close_callbacks(_setup: ()) {
    let server_probe = Probe::new(Reply::Pong);
    let (server, port) = start_server(server_config(Transport::Tcp), &server_probe);

    let client_probe = Probe::new(Reply::Nothing);
    let client = connect_client(port, Transport::Tcp, &client_probe);
    assert!(client.is_connected());
    assert!(wait_until(Duration::from_secs(5), || client_probe.count("connected") == 1));

    client.send(&"PING".to_string()).unwrap();
    assert!(wait_until(Duration::from_secs(5), || client_probe.messages() == ["PONG"]));
    assert_eq!(server_probe.messages(), ["PING"]);

    client.close();
    assert!(!client.is_connected());
    assert!(wait_until(Duration::from_secs(5), || server_probe.count("after-close") == 1));

    for probe in [&client_probe, &server_probe] {
        let events = probe.events();
        assert_eq!(probe.count("before-close"), 1, "{:?}", events);
        assert_eq!(probe.count("after-close"), 1, "{:?}", events);
        let before = events.iter().position(|e| e == "before-close").unwrap();
        let after = events.iter().position(|e| e == "after-close").unwrap();
        assert!(before < after, "{:?}", events);
        assert_eq!(probe.count("exception"), 0, "{:?}", events);
    }
    server.close();
}

#[rstest]
fn datagram_echo(_setup: ()) {
    let server_probe = Probe::new(Reply::Echo);
    let (server, port) = start_server(server_config(Transport::Udp), &server_probe);

    let client_probe = Probe::new(Reply::Nothing);
    let client = connect_client(port, Transport::Udp, &client_probe);
    assert!(client.is_connected());

    client.send(&"hello".to_string()).unwrap();
    client.send(&"world".to_string()).unwrap();
    assert!(wait_until(Duration::from_secs(5), || client_probe.messages().len() == 2));
    assert_eq!(client_probe.messages(), ["hello", "world"]);
    assert_eq!(server_probe.count("registered"), 1);

    client.close();
    server.close();
}

#[rstest]
fn frames_from_many_threads_keep_their_order(_setup: ()) {
    let server_probe = Probe::new(Reply::Nothing);
    let (server, port) = start_server(server_config(Transport::Tcp), &server_probe);
    let client = connect_client(port, Transport::Tcp, &Probe::new(Reply::Nothing));

    const THREADS: usize = 4;
    const PER_THREAD: usize = 250;
    let senders: Vec<_> = (0..THREADS)
        .map(|t| {
            let client = client.clone();
            thread::spawn(move || {
                for n in 0..PER_THREAD {
                    client.send(&format!("{}-{}", t, n)).unwrap();
                }
            })
        })
        .collect();
    for sender in senders {
        sender.join().unwrap();
    }

    assert!(wait_until(Duration::from_secs(10), || {
        server_probe.messages().len() == THREADS * PER_THREAD
    }));
    let mut last_seen: HashMap<usize, usize> = HashMap::new();
    for message in server_probe.messages() {
        let (t, n) = message.split_once('-').unwrap();
        let (t, n): (usize, usize) = (t.parse().unwrap(), n.parse().unwrap());
        if let Some(previous) = last_seen.insert(t, n) {
            assert_eq!(n, previous + 1, "thread {} out of order", t);
        } else {
            assert_eq!(n, 0);
        }
    }

    client.close();
    server.close();
}

#[rstest]
fn accepted_sessions_spread_over_processors(_setup: ()) {
    let server_probe = Probe::new(Reply::Echo);
    let config = ServerConfig {
        selector_count: 3,
        ..server_config(Transport::Tcp)
    };
    let (server, port) = start_server(config, &server_probe);

    let probes: Vec<Probe> = (0..4).map(|_| Probe::new(Reply::Nothing)).collect();
    let clients: Vec<Client<String>> = probes
        .iter()
        .map(|probe| connect_client(port, Transport::Tcp, probe))
        .collect();
    for (i, client) in clients.iter().enumerate() {
        client.send(&format!("hello {}", i)).unwrap();
    }
    for (i, probe) in probes.iter().enumerate() {
        let expected = format!("hello {}", i);
        assert!(wait_until(Duration::from_secs(5), || probe.messages() == [expected.clone()]));
    }

    for client in &clients {
        client.close();
    }
    server.close();
}

#[rstest]
fn start_and_close_are_idempotent(_setup: ()) {
    let probe = Probe::new(Reply::Nothing);
    let (server, port) = start_server(server_config(Transport::Tcp), &probe);
    server.start().unwrap();
    assert!(server.is_started());
    assert_eq!(server.local_addr().unwrap().port(), port);
    server.close();
    server.close();
    assert!(!server.is_started());
}

#[rstest]
fn connect_to_a_closed_port_fails(_setup: ()) {
    // bind and drop to find a port nobody listens on
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let client = Client::new(
        client_config(port, Transport::Tcp),
        LineCodec::new(),
        Probe::new(Reply::Nothing),
    )
    .unwrap();
    assert!(client.connect().is_err());
    assert!(!client.is_connected());
    assert!(client.send(&"lost".to_string()).is_err());
    client.close();
}

#[rstest]
fn reconnect_service_restores_the_connection(_setup: ()) {
    let server_probe = Probe::new(Reply::Echo);
    let (server, port) = start_server(server_config(Transport::Tcp), &server_probe);

    let client_probe = Probe::new(Reply::Nothing);
    let client = Client::new(
        client_config(port, Transport::Tcp),
        LineCodec::new(),
        client_probe.clone(),
    )
    .unwrap();
    client
        .add_service(ReconnectService::with_max_interval(
            Duration::from_millis(100),
            Duration::from_millis(400),
        ))
        .unwrap();
    client.connect().unwrap();
    let first = client.session().unwrap().id();

    server.close();
    assert!(wait_until(Duration::from_secs(5), || !client.is_connected()));

    let restarted = ServerConfig {
        port,
        ..server_config(Transport::Tcp)
    };
    let (server, _) = start_server(restarted, &server_probe);
    assert!(wait_until(Duration::from_secs(10), || client.is_connected()));
    assert_ne!(client.session().unwrap().id(), first);

    client.send(&"again".to_string()).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        client_probe.messages().contains(&"again".to_string())
    }));

    client.close();
    server.close();
}

#[derive(Default)]
struct ManagerEvents {
    received: Mutex<Vec<String>>,
    idle_removed: AtomicUsize,
}

#[derive(Clone, Default)]
struct ManagerProbe(Arc<ManagerEvents>);

impl SessionListener<String> for ManagerProbe {
    fn on_message_received(&self, message: String, _: &SessionWrapper<String>) -> AppResult<()> {
        self.0.received.lock().push(message);
        Ok(())
    }

    fn on_session_idle_removed(&self, _: &SessionWrapper<String>) {
        self.0.idle_removed.fetch_add(1, Ordering::SeqCst);
    }
}

fn start_manager(idle_time: Duration, probe: &ManagerProbe) -> (SessionManager<String>, u16) {
    let manager = SessionManager::new(
        server_config(Transport::Tcp),
        LineCodec::new(),
        probe.clone(),
        idle_time,
    )
    .unwrap();
    manager.initialize().unwrap();
    let port = manager.local_addr().unwrap().port();
    (manager, port)
}

#[rstest]
fn session_manager_directed_send_and_broadcast(_setup: ()) {
    let probe = ManagerProbe::default();
    let (manager, port) = start_manager(Duration::ZERO, &probe);

    let probes: Vec<Probe> = (0..2).map(|_| Probe::new(Reply::Nothing)).collect();
    let clients: Vec<Client<String>> = probes
        .iter()
        .map(|p| connect_client(port, Transport::Tcp, p))
        .collect();
    assert!(wait_until(Duration::from_secs(5), || manager.session_count() == 2));

    let unknown = stonenet::SessionId::new();
    assert!(!manager.contains(&unknown));
    assert!(!manager.send_to(&unknown, &"nobody".to_string()).unwrap());

    assert_eq!(manager.broadcast(&"news".to_string()), 2);
    for p in &probes {
        assert!(wait_until(Duration::from_secs(5), || p.messages() == ["news"]));
    }

    let target = manager.session_wrappers()[0].id();
    assert!(manager.send_to(&target, &"direct".to_string()).unwrap());
    assert!(wait_until(Duration::from_secs(5), || {
        probes
            .iter()
            .filter(|p| p.messages().contains(&"direct".to_string()))
            .count()
            == 1
    }));

    clients[0].close();
    assert!(wait_until(Duration::from_secs(5), || manager.session_count() == 1));
    clients[1].close();
    assert!(wait_until(Duration::from_secs(5), || manager.session_count() == 0));
    manager.close();
}

#[rstest]
fn idle_sweep_removes_only_stale_sessions(_setup: ()) {
    let probe = ManagerProbe::default();
    let idle = Duration::from_secs(60);
    let (manager, port) = start_manager(idle, &probe);

    let stale_probe = Probe::new(Reply::Nothing);
    let stale_client = connect_client(port, Transport::Tcp, &stale_probe);
    assert!(wait_until(Duration::from_secs(5), || manager.session_count() == 1));
    let stale = manager.session_wrappers()[0].clone();

    thread::sleep(Duration::from_millis(300));
    let fresh_client = connect_client(port, Transport::Tcp, &Probe::new(Reply::Nothing));
    fresh_client.send(&"still here".to_string()).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        probe.0.received.lock().contains(&"still here".to_string())
    }));
    assert_eq!(manager.session_count(), 2);

    let now = stale.last_touch_time() + idle.as_millis() as i64 + 100;
    assert_eq!(manager.sweep_idle_sessions_at(now), 1);
    assert!(!manager.contains(&stale.id()));
    assert_eq!(manager.session_count(), 1);
    assert_eq!(probe.0.idle_removed.load(Ordering::SeqCst), 1);

    // the swept session is closed, its client sees the end of stream
    assert!(wait_until(Duration::from_secs(5), || !stale_client.is_connected()));
    assert!(fresh_client.is_connected());

    stale_client.close();
    fresh_client.close();
    manager.close();
}

#[rstest]
fn saturated_pool_keeps_callbacks_off_the_reactor(_setup: ()) {
    let server_probe = Probe::slow(Reply::Echo, Duration::from_millis(200));
    let config = ServerConfig {
        executor_count: 1,
        thread_max_pool_size: 1,
        thread_queue_size: 1,
        ..server_config(Transport::Tcp)
    };
    let (server, port) = start_server(config, &server_probe);

    let probes: Vec<Probe> = (0..4).map(|_| Probe::new(Reply::Nothing)).collect();
    let clients: Vec<Client<String>> = probes
        .iter()
        .map(|p| connect_client(port, Transport::Tcp, p))
        .collect();
    for (i, client) in clients.iter().enumerate() {
        client.send(&format!("slow {}", i)).unwrap();
    }
    for (i, probe) in probes.iter().enumerate() {
        let expected = format!("slow {}", i);
        assert!(wait_until(Duration::from_secs(10), || probe.messages() == [expected.clone()]));
    }
    let threads = server_probe.callback_threads();
    assert_eq!(threads.len(), 4);
    assert_off_reactor(&threads);

    for client in &clients {
        client.close();
    }
    server.close();
}

#[rstest]
fn oversized_frame_fails_the_session_once(_setup: ()) {
    let server_probe = Probe::new(Reply::Echo);
    let server = Server::new(
        server_config(Transport::Tcp),
        LineCodec::new().with_max_line_length(16),
        server_probe.clone(),
    )
    .unwrap();
    server.start().unwrap();
    let port = server.local_addr().unwrap().port();

    let client_probe = Probe::new(Reply::Nothing);
    let client = connect_client(port, Transport::Tcp, &client_probe);
    client.send(&"x".repeat(64)).unwrap();

    assert!(wait_until(Duration::from_secs(5), || server_probe.count("after-close") == 1));
    assert!(wait_until(Duration::from_secs(5), || !client.is_connected()));

    let events = server_probe.events();
    assert_eq!(server_probe.count("exception"), 1, "{:?}", events);
    assert_eq!(server_probe.count("exception-status:Error"), 1, "{:?}", events);
    let exception = events.iter().position(|e| e == "exception").unwrap();
    let before = events.iter().position(|e| e == "before-close").unwrap();
    assert!(exception < before, "{:?}", events);
    assert!(server_probe.messages().is_empty());
    assert_off_reactor(&server_probe.callback_threads());

    client.close();
    server.close();
}

#[rstest]
fn reconnect_is_ignored_while_closing(_setup: ()) {
    let server_probe = Probe::new(Reply::Nothing);
    let (server, port) = start_server(server_config(Transport::Tcp), &server_probe);
    let client = connect_client(port, Transport::Tcp, &Probe::new(Reply::Nothing));
    assert!(wait_until(Duration::from_secs(5), || server_probe.count("registered") == 1));

    let racer = {
        let client = client.clone();
        thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_millis(300);
            while Instant::now() < deadline {
                client.reconnect().unwrap();
            }
        })
    };
    client.close();
    racer.join().unwrap();

    assert!(client.is_closing());
    client.reconnect().unwrap();
    assert!(!client.is_connected());
    assert!(client.session().is_none());
    thread::sleep(Duration::from_millis(200));
    assert_eq!(server_probe.count("registered"), 1);
    server.close();
}

#[rstest]
fn heartbeat_is_inert_until_initialized(_setup: ()) {
    let service: HeartbeatService<String> =
        HeartbeatService::new(Duration::from_millis(50), Duration::from_millis(150));
    assert!(!service.is_initialized());
    assert!(matches!(service.start(), Err(AppError::IllegalStateError(_))));
    assert!(!service.is_started());
    service.close();
    assert_eq!(service.staleness(), Duration::from_millis(150));
}

fn client_with_heartbeat(
    port: u16,
    probe: &Probe,
    heartbeat: HeartbeatService<String>,
) -> Client<String> {
    let client = Client::new(
        client_config(port, Transport::Tcp),
        LineCodec::new(),
        probe.clone(),
    )
    .unwrap();
    client.add_service(heartbeat).unwrap();
    client.connect().unwrap();
    client
}

#[rstest]
fn heartbeat_closes_a_silent_session(_setup: ()) {
    let server_probe = Probe::new(Reply::Nothing);
    let (server, port) = start_server(server_config(Transport::Tcp), &server_probe);

    let client_probe = Probe::new(Reply::Nothing);
    let heartbeat = HeartbeatService::new(Duration::from_millis(100), Duration::from_millis(300))
        .with_message(|| "HB".to_string());
    let client = client_with_heartbeat(port, &client_probe, heartbeat);

    assert!(wait_until(Duration::from_secs(5), || {
        server_probe.messages().contains(&"HB".to_string())
    }));
    assert!(wait_until(Duration::from_secs(5), || !client.is_connected()));
    assert!(wait_until(Duration::from_secs(5), || client_probe.count("after-close") == 1));
    assert_eq!(client_probe.count("before-close"), 1);
    assert_eq!(client.session().unwrap().status(), Status::Closed);

    client.close();
    server.close();
}

#[rstest]
fn heartbeat_replies_keep_the_session_alive(_setup: ()) {
    let server_probe = Probe::new(Reply::Echo);
    let (server, port) = start_server(server_config(Transport::Tcp), &server_probe);

    let heartbeat = HeartbeatService::new(Duration::from_millis(100), Duration::from_millis(300))
        .with_message(|| "HB".to_string());
    let client = client_with_heartbeat(port, &Probe::new(Reply::Nothing), heartbeat);

    thread::sleep(Duration::from_millis(1_000));
    assert!(client.is_connected());
    assert!(server_probe.messages().len() >= 3);

    client.close();
    server.close();
}

#[rstest]
fn heartbeat_reconnect_rebuilds_a_silent_session(_setup: ()) {
    let server_probe = Probe::new(Reply::Nothing);
    let (server, port) = start_server(server_config(Transport::Tcp), &server_probe);

    let heartbeat = HeartbeatService::new(Duration::from_millis(100), Duration::from_millis(300))
        .with_action(HeartbeatAction::Reconnect);
    let client = client_with_heartbeat(port, &Probe::new(Reply::Nothing), heartbeat);
    let first = client.session().unwrap().id();

    assert!(wait_until(Duration::from_secs(5), || {
        client
            .session()
            .is_some_and(|s| s.id() != first && s.is_connected())
    }));
    assert!(wait_until(Duration::from_secs(5), || server_probe.count("registered") >= 2));

    client.close();
    server.close();
}

#[rstest]
fn swept_datagram_peer_is_forgotten(_setup: ()) {
    let probe = ManagerProbe::default();
    let idle = Duration::from_secs(60);
    let manager = SessionManager::new(
        server_config(Transport::Udp),
        LineCodec::new(),
        probe.clone(),
        idle,
    )
    .unwrap();
    manager.initialize().unwrap();
    let port = manager.local_addr().unwrap().port();

    let client = connect_client(port, Transport::Udp, &Probe::new(Reply::Nothing));
    client.send(&"first".to_string()).unwrap();
    assert!(wait_until(Duration::from_secs(5), || manager.session_count() == 1));
    let peer = manager.session_wrappers()[0].clone();

    let now = peer.last_touch_time() + idle.as_millis() as i64 + 100;
    assert_eq!(manager.sweep_idle_sessions_at(now), 1);
    assert_eq!(manager.session_count(), 0);
    assert!(wait_until(Duration::from_secs(5), || peer.session().is_closed()));

    client.send(&"second".to_string()).unwrap();
    assert!(wait_until(Duration::from_secs(5), || manager.session_count() == 1));
    assert_ne!(manager.session_wrappers()[0].id(), peer.id());
    assert!(wait_until(Duration::from_secs(5), || {
        probe.0.received.lock().contains(&"second".to_string())
    }));

    client.close();
    manager.close();
}
