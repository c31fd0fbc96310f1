//! Common test utilities: an in-process profile server, a fake target
//! process and temporary volumes.

// Allow unused imports and dead code since this is a shared module
// used across multiple test files - not all items are used in every test file
#![allow(dead_code)]

#[allow(unused_imports)]
pub use bytes::Bytes;
#[allow(unused_imports)]
pub use nesys_lib::client::{ConnectionContext, ProfileClient, now_millis};
#[allow(unused_imports)]
pub use nesys_lib::constants::{CAR_PROFILE_SIZE, DRESS_UP_RANGE, HEADER_SIZE};
#[allow(unused_imports)]
pub use nesys_lib::error::NesysError;
#[allow(unused_imports)]
pub use nesys_lib::packet::{Header, Message, MessageId};
#[allow(unused_imports)]
pub use nesys_lib::process::{MemoryLayout, ProcessInspector, clear_tuned_flag};
#[allow(unused_imports)]
pub use nesys_lib::profile::CarProfile;
#[allow(unused_imports)]
pub use nesys_lib::profile_id::{ProfileId, id_file_path, read_id_file, write_id_file};
#[allow(unused_imports)]
pub use nesys_lib::volume::{DriveMask, MountedVolumes, VolumeScanner};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub const TEST_KEY: &[u8] = b"test-access-code";

/// Route worker logs through the test harness. Set RUST_LOG to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// How the mock server answers every request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Signed, timestamped, correct answers
    Normal,
    /// Correct answers without timestamp or auth tag
    Unsigned,
    /// Signed with a key the client does not know
    WrongKey,
    /// Signed, but every response reuses the same old timestamp
    Stale,
    /// Signed `AuthFailed`
    AuthFailed,
    /// Signed response with this message id and an empty body
    Reply(u16),
    /// Read the request, then never answer
    Silent,
    /// Send part of a header and close the connection
    CloseEarly,
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub id: MessageId,
    pub body: Bytes,
    pub timestamp: Option<i64>,
    pub verified: bool,
}

struct ServerState {
    behavior: Behavior,
    profiles: HashMap<(String, String), Vec<u8>>,
    requests: Vec<RecordedRequest>,
    next_profile: u64,
    last_timestamp: i64,
}

/// Profile server on a random local port
pub struct MockServer {
    addr: SocketAddr,
    state: Arc<Mutex<ServerState>>,
    task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(ServerState {
            behavior,
            profiles: HashMap::new(),
            requests: Vec::new(),
            next_profile: 0x00AB_0000_0001,
            last_timestamp: 0,
        }));

        let accept_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    let _ = serve(stream, state).await;
                });
            }
        });

        Self { addr, state, task }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn context(&self) -> ConnectionContext {
        ConnectionContext::new(TEST_KEY, "127.0.0.1", self.port())
    }

    pub fn client(&self) -> ProfileClient {
        ProfileClient::new(self.context())
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        self.state.lock().behavior = behavior;
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().requests.clone()
    }

    pub fn request_ids(&self) -> Vec<MessageId> {
        self.state.lock().requests.iter().map(|r| r.id).collect()
    }

    pub fn put_profile(&self, profile_id: ProfileId, plate: &str, data: &[u8]) {
        self.state
            .lock()
            .profiles
            .insert((profile_id.to_text(), plate.to_string()), data.to_vec());
    }

    pub fn stored_profile(&self, profile_id: ProfileId, plate: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .profiles
            .get(&(profile_id.to_text(), plate.to_string()))
            .cloned()
    }

    /// Id the next `NewProfile` request will be given
    pub fn next_profile_id(&self) -> ProfileId {
        ProfileId::new(self.state.lock().next_profile)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(mut stream: TcpStream, state: Arc<Mutex<ServerState>>) -> std::io::Result<()> {
    let mut header = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header).await?;
    let parsed = Header::decode(&header).unwrap();
    let mut frame = header.to_vec();
    frame.resize(parsed.total_wire_size(), 0);
    stream.read_exact(&mut frame[HEADER_SIZE..]).await?;
    let request = Message::decode(&frame).unwrap();

    let (behavior, response) = {
        let mut state = state.lock();
        state.requests.push(RecordedRequest {
            id: request.id,
            body: request.body.clone(),
            timestamp: request.timestamp,
            verified: request.verify(TEST_KEY),
        });
        (state.behavior, answer(&mut state, &request))
    };

    match behavior {
        Behavior::Silent => {
            tokio::time::sleep(Duration::from_secs(30)).await;
            return Ok(());
        }
        Behavior::CloseEarly => {
            stream.write_all(&[0x00, 0x00, 0x01]).await?;
            return stream.shutdown().await;
        }
        _ => {}
    }

    let bytes = response.encode().unwrap();
    stream.write_all(&bytes).await?;
    stream.shutdown().await
}

fn answer(state: &mut ServerState, request: &Message) -> Message {
    let (id, body) = match state.behavior {
        Behavior::AuthFailed => (MessageId::AuthFailed, Vec::new()),
        Behavior::Reply(id) => (MessageId::from(id), Vec::new()),
        _ => handle(state, request),
    };
    let response = Message::new(id, body);

    match state.behavior {
        Behavior::Unsigned => response,
        Behavior::WrongKey => response
            .with_timestamp(next_timestamp(state))
            .signed(b"some-other-key")
            .unwrap(),
        Behavior::Stale => response.with_timestamp(1).signed(TEST_KEY).unwrap(),
        _ => response
            .with_timestamp(next_timestamp(state))
            .signed(TEST_KEY)
            .unwrap(),
    }
}

fn next_timestamp(state: &mut ServerState) -> i64 {
    state.last_timestamp = now_millis().max(state.last_timestamp + 1);
    state.last_timestamp
}

fn handle(state: &mut ServerState, request: &Message) -> (MessageId, Vec<u8>) {
    match request.id {
        MessageId::Ping => (MessageId::Success, Vec::new()),
        MessageId::NewProfile => {
            let id = ProfileId::new(state.next_profile);
            state.next_profile += 1;
            (MessageId::Success, id.encode().to_vec())
        }
        MessageId::GetProfile => {
            let (profile_id, plate, _) = parse_profile_body(&request.body);
            let stored = state.profiles.get(&(profile_id, plate)).cloned();
            (MessageId::Success, stored.unwrap_or_default())
        }
        MessageId::SetProfile => {
            let (profile_id, plate, data) = parse_profile_body(&request.body);
            state.profiles.insert((profile_id, plate), data.unwrap_or_default());
            (MessageId::Success, Vec::new())
        }
        _ => (MessageId::BadDecode, Vec::new()),
    }
}

/// Split a profile request body into id text, plate and optional data
pub fn parse_profile_body(body: &[u8]) -> (String, String, Option<Vec<u8>>) {
    let id_len = body[0] as usize;
    let id = String::from_utf8_lossy(&body[1..1 + id_len]).into_owned();
    let rest = &body[1 + id_len..];
    let plate_len = rest[0] as usize;
    let plate = String::from_utf8_lossy(&rest[1..1 + plate_len]).into_owned();
    let rest = &rest[1 + plate_len..];
    let data = (rest.len() >= 2).then(|| {
        let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
        rest[2..2 + len].to_vec()
    });
    (id, plate, data)
}

/// State of the fake target process
#[derive(Debug, Clone)]
pub struct GameState {
    pub exe_name: String,
    pub running: bool,
    pub active: bool,
    pub tuned: bool,
    pub block: [u8; CAR_PROFILE_SIZE],
    pub short_name: [u8; 4],
    pub block_writes: usize,
    pub dress_up_writes: usize,
    /// Memory access fails while the process keeps running
    pub access_denied: bool,
    pub attaches: usize,
}

/// Process inspector backed by in-memory state the test can change
#[derive(Debug, Clone)]
pub struct FakeGame {
    state: Arc<Mutex<GameState>>,
}

impl FakeGame {
    pub fn new(exe_name: &str, plate: &str) -> Self {
        let mut short_name = [0u8; 4];
        let len = plate.len().min(4);
        short_name[..len].copy_from_slice(&plate.as_bytes()[..len]);
        Self {
            state: Arc::new(Mutex::new(GameState {
                exe_name: exe_name.to_string(),
                running: false,
                active: false,
                tuned: false,
                block: [0u8; CAR_PROFILE_SIZE],
                short_name,
                block_writes: 0,
                dress_up_writes: 0,
                access_denied: false,
                attaches: 0,
            })),
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut GameState)) {
        f(&mut self.state.lock());
    }

    pub fn snapshot(&self) -> GameState {
        self.state.lock().clone()
    }

    fn with_running<T>(&self, f: impl FnOnce(&mut GameState) -> T) -> Result<T, NesysError> {
        let mut state = self.state.lock();
        if !state.running {
            return Err(NesysError::ProcessAccess("process exited".to_string()));
        }
        if state.access_denied {
            return Err(NesysError::ProcessAccess("permission denied".to_string()));
        }
        Ok(f(&mut state))
    }
}

impl ProcessInspector for FakeGame {
    type Handle = ();

    fn find_process(&self, exe_name: &str) -> Option<()> {
        let mut state = self.state.lock();
        let found = state.running && state.exe_name.eq_ignore_ascii_case(exe_name);
        if found {
            state.attaches += 1;
        }
        found.then_some(())
    }

    fn is_alive(&self, _handle: &()) -> bool {
        self.state.lock().running
    }

    fn read_block(&self, _handle: &()) -> Result<CarProfile, NesysError> {
        self.with_running(|s| {
            let mut profile = CarProfile::from_bytes(s.block);
            clear_tuned_flag(&mut profile, &MemoryLayout::default());
            profile
        })
    }

    fn write_block(&self, _handle: &(), profile: &CarProfile) -> Result<(), NesysError> {
        self.with_running(|s| {
            s.block = *profile.as_bytes();
            s.block_writes += 1;
        })
    }

    fn is_profile_active(&self, _handle: &()) -> Result<bool, NesysError> {
        self.with_running(|s| s.active)
    }

    fn is_tuned(&self, _handle: &()) -> Result<bool, NesysError> {
        self.with_running(|s| s.tuned)
    }

    fn read_short_name(&self, _handle: &()) -> Result<String, NesysError> {
        self.with_running(|s| nesys_lib::process::short_name_from_bytes(&s.short_name))
    }

    fn write_dress_up(&self, _handle: &(), profile: &CarProfile) -> Result<(), NesysError> {
        self.with_running(|s| {
            s.block[DRESS_UP_RANGE].copy_from_slice(profile.dress_up());
            s.dress_up_writes += 1;
        })
    }
}

/// Temporary directories mounted as the given drive letters
pub fn temp_volumes(letters: &str) -> (TempDir, MountedVolumes) {
    let dir = tempfile::tempdir().unwrap();
    let mut volumes = MountedVolumes::new();
    for slot in DriveMask::from_letters(letters).slots() {
        let root = dir.path().join(format!("drive_{slot}"));
        std::fs::create_dir(&root).unwrap();
        volumes.insert(slot, root);
    }
    (dir, volumes)
}

/// Poll `check` until it returns `Some`, failing the test after five seconds
pub async fn wait_for<T>(what: &str, mut check: impl FnMut() -> Option<T>) -> T {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(value) = check() {
            return value;
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
