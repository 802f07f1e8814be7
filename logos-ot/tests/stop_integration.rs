//! Integration tests for the stop/start handshake between live sessions.
//!
//! A router task moves envelopes between sessions the way a network
//! transport would; sites can be taken offline to simulate partitions.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use logos_ot::{
    CancellationToken, ChannelTransport, DocumentId, EditorBinding, Envelope, JupiterError,
    LogProgress, Operation, Session, SessionConfig, SessionError, SiteId, StopError, User,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use uuid::Uuid;

#[derive(Default)]
struct Buffers {
    texts: Mutex<HashMap<DocumentId, String>>,
}

impl Buffers {
    fn apply(&self, document: DocumentId, operation: &Operation) {
        let mut texts = self.texts.lock();
        operation.apply(texts.entry(document).or_default()).unwrap();
    }

    fn replace(&self, document: DocumentId, text: &str) {
        self.texts.lock().insert(document, text.to_string());
    }
}

impl EditorBinding for Buffers {
    fn remote_edit_ready(&self, document: DocumentId, operation: &Operation) {
        self.apply(document, operation);
    }

    fn revert_ready(&self, document: DocumentId, operation: &Operation) {
        self.apply(document, operation);
    }

    fn content(&self, document: DocumentId) -> Option<String> {
        self.texts.lock().get(&document).cloned()
    }
}

struct Cluster {
    host: SiteId,
    guests: Vec<SiteId>,
    document: DocumentId,
    sessions: Arc<HashMap<SiteId, Arc<Session>>>,
    buffers: HashMap<SiteId, Arc<Buffers>>,
    offline: Arc<Mutex<HashSet<SiteId>>>,
    router: JoinHandle<()>,
}

impl Cluster {
    fn start(guests: usize, base: &str, config: SessionConfig) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let (tx, rx) = mpsc::unbounded_channel();
        let document = Uuid::new_v4();
        let users: Vec<User> = (0..=guests)
            .map(|i| User::new(format!("site{i}")))
            .collect();
        let host = users[0].id;
        let guest_ids: Vec<SiteId> = users[1..].iter().map(|user| user.id).collect();

        let mut sessions = HashMap::new();
        let mut buffers = HashMap::new();
        for user in &users {
            let buffer = Arc::new(Buffers::default());
            buffer.replace(document, base);
            let session = Session::new(
                config.clone(),
                user.clone(),
                host,
                Arc::new(ChannelTransport::with_sender(user.id, tx.clone())),
                buffer.clone(),
            );
            for other in users.iter().filter(|other| other.id != user.id) {
                session.add_participant(other.clone());
            }
            let shared_with: &[SiteId] = if user.id == host { &guest_ids } else { &[] };
            session.share_document(document, shared_with).unwrap();
            sessions.insert(user.id, Arc::new(session));
            buffers.insert(user.id, buffer);
        }

        let sessions = Arc::new(sessions);
        let offline = Arc::new(Mutex::new(HashSet::new()));
        let router = spawn_router(sessions.clone(), offline.clone(), rx);
        Self {
            host,
            guests: guest_ids,
            document,
            sessions,
            buffers,
            offline,
            router,
        }
    }

    fn session(&self, site: SiteId) -> &Session {
        &self.sessions[&site]
    }

    fn host_session(&self) -> &Session {
        self.session(self.host)
    }

    fn edit(&self, site: SiteId, operation: Operation) -> Result<(), SessionError> {
        self.session(site)
            .local_edit_produced(self.document, operation.clone())?;
        self.buffers[&site].apply(self.document, &operation);
        Ok(())
    }

    fn text(&self, site: SiteId) -> String {
        self.buffers[&site].content(self.document).unwrap()
    }

    fn converged(&self) -> bool {
        let host_text = self.text(self.host);
        self.guests.iter().all(|guest| self.text(*guest) == host_text)
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.router.abort();
    }
}

/// Deliver every envelope to its destination session, dropping traffic to
/// offline sites.
fn spawn_router(
    sessions: Arc<HashMap<SiteId, Arc<Session>>>,
    offline: Arc<Mutex<HashSet<SiteId>>>,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            if offline.lock().contains(&envelope.destination) {
                continue;
            }
            let Some(session) = sessions.get(&envelope.destination) else {
                continue;
            };
            if let Err(err) = session.receive(envelope.source, envelope.activity) {
                log::warn!("delivery to {} failed: {err}", envelope.destination);
            }
        }
    })
}

/// Poll `condition` until it holds, failing the test after a few seconds.
async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let wait = async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    };
    if timeout(Duration::from_secs(5), wait).await.is_err() {
        panic!("timed out waiting for {what}");
    }
}

fn quick_timeouts() -> SessionConfig {
    SessionConfig {
        stop_timeout_ms: 100,
        start_timeout_ms: 100,
        ..SessionConfig::default()
    }
}

#[tokio::test]
async fn test_stop_blocks_guest_edits_until_started() {
    let cluster = Cluster::start(1, "hello", SessionConfig::default());
    let guest = cluster.guests[0];
    let monitor = LogProgress::new();

    let handles = cluster
        .host_session()
        .stop(Some(guest), "maintenance", &monitor)
        .await
        .unwrap();
    assert_eq!(handles.len(), 1);
    assert!(cluster.session(guest).stop_manager().is_locally_blocked());
    assert!(cluster.host_session().stop_manager().is_blocked(guest));

    assert_eq!(
        cluster.edit(guest, Operation::insert(0, "x")),
        Err(SessionError::Jupiter(JupiterError::Blocked(cluster.document)))
    );
    // The host keeps editing while the guest is frozen.
    cluster.edit(cluster.host, Operation::insert(5, "!")).unwrap();

    assert!(handles[0].start_and_await(&monitor).await.unwrap());
    assert!(!cluster.session(guest).stop_manager().is_locally_blocked());
    assert!(!cluster.host_session().stop_manager().is_blocked(guest));

    cluster.edit(guest, Operation::insert(0, ">")).unwrap();
    eventually("convergence", || cluster.converged()).await;
    assert_eq!(cluster.text(guest), ">hello!");
}

#[tokio::test]
async fn test_stop_everyone_with_accumulated_locks() {
    let cluster = Cluster::start(2, "", SessionConfig::default());
    let (first, second) = (cluster.guests[0], cluster.guests[1]);
    let monitor = LogProgress::new();

    let everyone = cluster
        .host_session()
        .stop(None, "snapshot", &monitor)
        .await
        .unwrap();
    assert_eq!(everyone.len(), 2);
    let again = cluster
        .host_session()
        .stop(Some(first), "second reason", &monitor)
        .await
        .unwrap();

    let first_handle = everyone.iter().find(|h| h.user() == first).unwrap();
    let second_handle = everyone.iter().find(|h| h.user() == second).unwrap();

    // One lock on `first` remains after releasing the other.
    assert!(!first_handle.start().unwrap());
    assert!(first_handle.await_acknowledged(&monitor).await.unwrap());
    assert!(cluster.session(first).stop_manager().is_locally_blocked());
    assert!(cluster.host_session().stop_manager().is_blocked(first));

    assert!(second_handle.start_and_await(&monitor).await.unwrap());
    assert!(!cluster.session(second).stop_manager().is_locally_blocked());

    assert!(again[0].start().unwrap());
    assert!(again[0].await_acknowledged(&monitor).await.unwrap());
    assert!(!cluster.session(first).stop_manager().is_locally_blocked());

    assert!(matches!(
        again[0].start(),
        Err(StopError::AlreadyStarted(_))
    ));
}

#[tokio::test]
async fn test_stop_times_out_for_unreachable_guest() {
    let cluster = Cluster::start(2, "", quick_timeouts());
    let (reachable, unreachable) = (cluster.guests[0], cluster.guests[1]);
    cluster.offline.lock().insert(unreachable);

    let err = cluster
        .host_session()
        .stop(None, "backup", &LogProgress::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::Stop(StopError::Timeout { user, .. }) if user == unreachable
    ));

    // The lock that did land is released again.
    eventually("release of the reachable guest", || {
        !cluster.session(reachable).stop_manager().is_locally_blocked()
    })
    .await;
    assert!(!cluster.host_session().stop_manager().is_blocked(reachable));
    assert!(!cluster.host_session().stop_manager().is_blocked(unreachable));
}

#[tokio::test]
async fn test_cancelled_stop_releases_locks() {
    let cluster = Cluster::start(1, "", SessionConfig::default());
    let guest = cluster.guests[0];
    cluster.offline.lock().insert(guest);

    let token = CancellationToken::new();
    let monitor = LogProgress::with_token(token.clone());
    let canceller = tokio::spawn(async move {
        sleep(Duration::from_millis(20)).await;
        token.cancel();
    });

    let err = cluster
        .host_session()
        .stop(Some(guest), "user pressed cancel", &monitor)
        .await
        .unwrap_err();
    canceller.await.unwrap();
    assert_eq!(err, SessionError::Stop(StopError::Cancelled));
    assert!(!cluster.host_session().stop_manager().is_blocked(guest));
}

#[tokio::test]
async fn test_unacknowledged_start_reports_false() {
    let cluster = Cluster::start(1, "", quick_timeouts());
    let guest = cluster.guests[0];
    let monitor = LogProgress::new();

    let handles = cluster
        .host_session()
        .stop(Some(guest), "flaky link", &monitor)
        .await
        .unwrap();
    cluster.offline.lock().insert(guest);

    assert!(!handles[0].start_and_await(&monitor).await.unwrap());
    // The handle stays started; the host no longer counts the guest as stopped.
    assert!(!cluster.host_session().stop_manager().is_blocked(guest));
}

#[tokio::test]
async fn test_recovery_of_diverged_guest() {
    let cluster = Cluster::start(2, "base", SessionConfig::default());
    let (healthy, broken) = (cluster.guests[0], cluster.guests[1]);
    let doc = cluster.document;
    let monitor = LogProgress::new();

    cluster.edit(healthy, Operation::insert(4, " text")).unwrap();
    eventually("first sync", || cluster.converged()).await;

    cluster.buffers[&broken].replace(doc, "corrupted");
    let host_text = cluster.text(cluster.host);
    for guest in [healthy, broken] {
        assert!(cluster
            .host_session()
            .send_checksum(doc, guest, &host_text)
            .unwrap());
    }

    let reports = Arc::new(Mutex::new(Vec::new()));
    eventually("mismatch report", || {
        let taken = cluster.host_session().take_inconsistencies();
        let mut reports = reports.lock();
        reports.extend(taken.get(&doc).into_iter().flatten().copied());
        !reports.is_empty()
    })
    .await;
    assert_eq!(reports.lock().as_slice(), &[broken]);

    // Freeze the diverged guest, replace its copy and restart the pair.
    let handles = cluster
        .host_session()
        .stop(Some(broken), "recovery", &monitor)
        .await
        .unwrap();
    cluster.buffers[&broken].replace(doc, &host_text);
    cluster.session(broken).reset_document(doc).unwrap();
    cluster.host_session().reset_site(doc, broken).unwrap();
    assert!(handles[0].start_and_await(&monitor).await.unwrap());

    cluster.edit(broken, Operation::insert(0, "[")).unwrap();
    cluster.edit(healthy, Operation::insert(9, "]")).unwrap();
    cluster.edit(cluster.host, Operation::delete(4, " ")).unwrap();
    eventually("convergence after recovery", || cluster.converged()).await;
    assert_eq!(cluster.text(cluster.host), "[basetext]");
}
