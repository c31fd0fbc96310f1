//! Background worker that keeps the profile id, the server and the target
//! process in sync.
//!
//! One attempt walks the phases in order: pick the selected drives, find or
//! request a profile id, wait for the process and its active profile, fetch
//! the stored profile (seeding the server if it has none), write it into
//! the process, write the dress-up block once the car is tuned, then push
//! every later change in memory back to the server. Whenever the process
//! goes away or a transient error occurs the worker starts over from the
//! drives. Authentication rejections end the worker.

use crate::blackboard::Blackboard;
use crate::client::{ConnectionContext, ProfileClient};
use crate::error::{ErrorClass, NesysError};
use crate::process::ProcessInspector;
use crate::profile::CarProfile;
use crate::profile_id::{ProfileId, id_file_path, read_id_file, write_id_file};
use crate::volume::{Volume, VolumeScanner};
use std::sync::Arc;
use std::time::Duration;
use strum_macros::Display;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerTiming {
    /// Delay between polls of drives and process flags
    pub poll: Duration,
    /// Delay between searches for the process
    pub process_poll: Duration,
    /// Pause after reporting a failed request
    pub failure_backoff: Duration,
    /// Interval between memory comparisons in the sync loop
    pub sync_interval: Duration,
}

impl Default for WorkerTiming {
    fn default() -> Self {
        Self {
            poll: Duration::from_millis(35),
            process_poll: Duration::from_millis(500),
            failure_backoff: Duration::from_millis(2500),
            sync_interval: Duration::from_millis(300),
        }
    }
}

/// Why the worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum WorkerExit {
    #[strum(to_string = "stop requested")]
    StopRequested,
    #[strum(to_string = "settings incomplete")]
    Misconfigured,
    #[strum(to_string = "authentication rejected")]
    AuthRejected,
}

/// How an attempt ended early
enum Stop {
    /// Go back to the drive phase
    Restart,
    /// Go back to the drive phase after the failure back-off
    Backoff,
    Exit(WorkerExit),
}

type Step<T> = Result<T, Stop>;

/// The sync worker. Inspector calls and blackboard access run inline on
/// the worker task: both are short reads and the blackboard lock is only
/// ever held for a field copy. Id file IO goes through the blocking pool.
pub struct Worker<V, P> {
    board: Arc<Blackboard>,
    volumes: V,
    inspector: P,
    timing: WorkerTiming,
}

impl<V, P> Worker<V, P>
where
    V: VolumeScanner,
    P: ProcessInspector,
{
    pub fn new(board: Arc<Blackboard>, volumes: V, inspector: P) -> Self {
        Self {
            board,
            volumes,
            inspector,
            timing: WorkerTiming::default(),
        }
    }

    pub fn with_timing(mut self, timing: WorkerTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Run on the tokio runtime. The returned handle can stop and join it.
    pub fn spawn(self) -> WorkerHandle
    where
        V: 'static,
        P: 'static,
        P::Handle: 'static,
    {
        let board = Arc::clone(&self.board);
        let task = tokio::spawn(self.run());
        WorkerHandle { board, task }
    }

    pub async fn run(mut self) -> WorkerExit {
        info!("worker started");
        let exit = match self.start().await {
            Ok((mut client, exe_name)) => self.run_attempts(&mut client, &exe_name).await,
            Err(exit) => exit,
        };
        info!(%exit, "worker finished");
        exit
    }

    /// Validate the settings, build the client and ping the server
    async fn start(&mut self) -> Result<(ProfileClient, String), WorkerExit> {
        let exe_name = self.board.game_exe_name().unwrap_or_default();
        if exe_name.is_empty() {
            self.board
                .set_status("Please set an executable name in the config file.");
            return Err(WorkerExit::Misconfigured);
        }

        let address = self.board.server_address().unwrap_or_default();
        let port = self.board.port().unwrap_or(0);
        if address.is_empty() || port == 0 {
            self.board
                .set_status("Please set a server IP & Port address in the config file.");
            return Err(WorkerExit::Misconfigured);
        }

        let key = self.board.take_shared_key().unwrap_or_default();
        if key.is_empty() {
            self.board
                .set_status("Please set the access key in the config file.");
            return Err(WorkerExit::Misconfigured);
        }

        let mut client = ProfileClient::new(ConnectionContext::new(key, address, port));

        self.board.set_status("Pinging the server!");
        match client.ping().await {
            Ok(round_trip) => {
                info!(round_trip_ms = round_trip.as_millis() as u64, "server answered ping");
                self.board.set_status("Finished pinging server!");
            }
            Err(e) if e.is_fatal() => {
                error!("ping rejected: {e}");
                self.board.set_status(e.status_text());
                return Err(WorkerExit::AuthRejected);
            }
            Err(e) => {
                warn!("ping failed: {e}");
                self.board.set_status("Finished pinging server!");
            }
        }

        Ok((client, exe_name))
    }

    async fn run_attempts(&mut self, client: &mut ProfileClient, exe_name: &str) -> WorkerExit {
        loop {
            // Nothing is on display until the next id is acquired
            self.board.set_profile_id_text("");
            if self.board.stop_requested() {
                return WorkerExit::StopRequested;
            }
            match self.attempt(client, exe_name).await {
                Ok(()) | Err(Stop::Restart) => sleep(self.timing.poll).await,
                Err(Stop::Backoff) => sleep(self.timing.failure_backoff).await,
                Err(Stop::Exit(exit)) => return exit,
            }
        }
    }

    async fn attempt(&mut self, client: &mut ProfileClient, exe_name: &str) -> Step<()> {
        let volumes = self.acquire_drives()?;
        let profile_id = self.acquire_profile_id(client, &volumes).await?;
        self.board.set_profile_id_text(profile_id.to_text());

        let handle = self.await_process(exe_name).await?;
        self.sync_with_process(client, profile_id, &handle).await
    }

    fn acquire_drives(&self) -> Step<Vec<Volume>> {
        let Some(selected) = self.board.selected_drives() else {
            return Err(Stop::Restart);
        };
        let volumes = self.volumes.selected_volumes(selected);
        if volumes.is_empty() {
            self.board.set_status("Please select a removable drive.");
            return Err(Stop::Restart);
        }
        Ok(volumes)
    }

    async fn acquire_profile_id(
        &mut self,
        client: &mut ProfileClient,
        volumes: &[Volume],
    ) -> Step<ProfileId> {
        if let Some(id) = on_volumes(volumes, find_id_on_volumes).await? {
            self.board.set_status("Got Profile ID from drives.");
            on_volumes(volumes, move |v| save_id_on_volumes(v, id)).await?;
            return Ok(id);
        }

        self.board.set_status("Requesting new Profile ID from server.");
        match client.request_new_profile_id().await {
            Ok(id) => {
                info!(%id, "server allocated a new profile id");
                self.board.set_status("Saving Profile ID to drives.");
                on_volumes(volumes, move |v| save_id_on_volumes(v, id)).await?;
                Ok(id)
            }
            Err(e) => Err(self.report_failure(e).await),
        }
    }

    async fn await_process(&mut self, exe_name: &str) -> Step<P::Handle> {
        let status = format!("Looking for game process ({exe_name})");
        loop {
            self.check_stop()?;
            self.board.set_status(status.clone());
            if let Some(handle) = self.inspector.find_process(exe_name) {
                debug!(exe_name, "attached to process");
                return Ok(handle);
            }
            sleep(self.timing.process_poll).await;
        }
    }

    async fn sync_with_process(
        &mut self,
        client: &mut ProfileClient,
        profile_id: ProfileId,
        handle: &P::Handle,
    ) -> Step<()> {
        self.board.set_status("Waiting for an active profile.");
        loop {
            self.check_stop()?;
            sleep(self.timing.poll).await;
            if self.probe(handle, P::is_profile_active)? {
                break;
            }
        }

        let plate = self.probe(handle, P::read_short_name)?;
        debug!(%profile_id, plate, "fetching stored profile");
        let stored = loop {
            match client.fetch_car_profile(profile_id, &plate).await {
                Ok(stored) => break stored,
                Err(e) => {
                    if let Stop::Exit(exit) = self.report_failure(e).await {
                        return Err(Stop::Exit(exit));
                    }
                    self.check_stop()?;
                    if !self.still_active(handle) {
                        return Err(Stop::Restart);
                    }
                }
            }
        };
        self.board.set_status("Received profile info from the server!");

        if !self.still_active(handle) {
            return Err(Stop::Restart);
        }
        let current = match stored {
            Some(profile) => profile,
            None => self.seed_server(client, profile_id, &plate, handle).await?,
        };

        if !self.still_active(handle) {
            return Err(Stop::Restart);
        }
        self.probe(handle, |inspector, h| inspector.write_block(h, &current))?;

        self.board.set_status("Waiting to write dress up data!");
        loop {
            self.check_stop()?;
            sleep(self.timing.poll).await;
            if self.probe(handle, P::is_tuned)? {
                break;
            }
            if !self.probe(handle, P::is_profile_active)? {
                return Err(Stop::Restart);
            }
        }

        self.probe(handle, |inspector, h| inspector.write_dress_up(h, &current))?;
        self.board.set_status("Wrote dressup data.");

        self.push_changes(client, profile_id, &plate, handle, current)
            .await
    }

    /// The server has nothing for this profile yet, give it the block that
    /// is in memory right now. Failing to store is not fatal.
    async fn seed_server(
        &mut self,
        client: &mut ProfileClient,
        profile_id: ProfileId,
        plate: &str,
        handle: &P::Handle,
    ) -> Step<CarProfile> {
        info!(%profile_id, plate, "no stored profile, seeding from process memory");
        let block = self.probe(handle, P::read_block)?;
        if let Err(e) = client.store_car_profile(profile_id, plate, &block).await {
            if e.is_fatal() {
                return Err(self.report_failure(e).await);
            }
            warn!("seeding the server failed: {e}");
        }
        Ok(block)
    }

    async fn push_changes(
        &mut self,
        client: &mut ProfileClient,
        profile_id: ProfileId,
        plate: &str,
        handle: &P::Handle,
        mut last: CarProfile,
    ) -> Step<()> {
        loop {
            self.check_stop()?;
            sleep(self.timing.sync_interval).await;
            if !self.still_active(handle) {
                debug!("profile no longer active");
                return Ok(());
            }
            let current = match self.inspector.read_block(handle) {
                Ok(block) => block,
                Err(e) => {
                    debug!("skipping sync tick: {e}");
                    continue;
                }
            };
            if current == last {
                self.board.set_status("No changes to send to server.");
                continue;
            }

            last = current;
            self.board.set_status("Sending changes to server.");
            match client.store_car_profile(profile_id, plate, &last).await {
                Ok(()) => self.board.set_status("Successfully, sent changes!"),
                Err(e) if e.is_fatal() => return Err(self.report_failure(e).await),
                Err(e) => {
                    warn!("sending changes failed: {e}");
                    self.board.set_status("Failed to send changes!")
                }
            };
        }
    }

    /// Run an inspector operation. If it fails while the process is still
    /// alive the failure is reported and the attempt starts over after the
    /// back-off. If the process is gone it starts over right away.
    fn probe<T>(
        &self,
        handle: &P::Handle,
        op: impl FnOnce(&P, &P::Handle) -> Result<T, NesysError>,
    ) -> Step<T> {
        op(&self.inspector, handle).map_err(|e| {
            if self.inspector.is_alive(handle) {
                warn!("process access failed: {e}");
                self.board.set_status(e.status_text());
                Stop::Backoff
            } else {
                debug!("process exited: {e}");
                Stop::Restart
            }
        })
    }

    fn still_active(&self, handle: &P::Handle) -> bool {
        self.inspector.is_profile_active(handle).unwrap_or(false)
    }

    fn check_stop(&self) -> Step<()> {
        if self.board.stop_requested() {
            Err(Stop::Exit(WorkerExit::StopRequested))
        } else {
            Ok(())
        }
    }

    /// Publish a failed request and decide how the worker continues
    async fn report_failure(&mut self, err: NesysError) -> Stop {
        self.board.set_status(err.status_text());
        match err.classify() {
            ErrorClass::Fatal => {
                error!("request rejected: {err}");
                Stop::Exit(WorkerExit::AuthRejected)
            }
            ErrorClass::Retry => {
                warn!("request failed, retrying: {err}");
                sleep(self.timing.failure_backoff).await;
                Stop::Restart
            }
            ErrorClass::Degrade => {
                warn!("request failed: {err}");
                sleep(self.timing.failure_backoff).await;
                Stop::Restart
            }
        }
    }
}

/// Run id file IO on the blocking pool. Removable drives can stall.
async fn on_volumes<T, F>(volumes: &[Volume], f: F) -> Step<T>
where
    T: Send + 'static,
    F: FnOnce(&[Volume]) -> T + Send + 'static,
{
    let volumes = volumes.to_vec();
    tokio::task::spawn_blocking(move || f(&volumes))
        .await
        .map_err(|e| {
            error!("drive task failed: {e}");
            Stop::Backoff
        })
}

/// First well-formed id file in drive-letter order
fn find_id_on_volumes(volumes: &[Volume]) -> Option<ProfileId> {
    volumes.iter().find_map(|volume| {
        match read_id_file(&id_file_path(&volume.root)) {
            Ok(id) => Some(id),
            Err(e) => {
                debug!(drive = %volume.letter(), "no usable id file: {e}");
                None
            }
        }
    })
}

/// Write `id` to every volume that does not already hold it. Returns the
/// number of files written.
fn save_id_on_volumes(volumes: &[Volume], id: ProfileId) -> usize {
    let mut written = 0;
    for volume in volumes {
        let path = id_file_path(&volume.root);
        if read_id_file(&path).is_ok_and(|current| current == id) {
            continue;
        }
        match write_id_file(&path, id) {
            Ok(()) => written += 1,
            Err(e) => warn!(drive = %volume.letter(), "failed to save profile id: {e}"),
        }
    }
    written
}

/// Handle to a spawned worker
pub struct WorkerHandle {
    board: Arc<Blackboard>,
    task: JoinHandle<WorkerExit>,
}

impl WorkerHandle {
    pub fn request_stop(&self) -> bool {
        self.board.request_stop()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the worker to end
    pub async fn join(self) -> Result<WorkerExit, JoinError> {
        self.task.await
    }

    /// Request a stop and wait for the worker to end
    pub async fn shutdown(self) -> Result<WorkerExit, JoinError> {
        self.request_stop();
        self.join().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::{DriveMask, MountedVolumes};
    use std::fs;

    #[test]
    fn test_default_timing() {
        let timing = WorkerTiming::default();
        assert_eq!(timing.poll, Duration::from_millis(35));
        assert_eq!(timing.process_poll, Duration::from_millis(500));
        assert_eq!(timing.failure_backoff, Duration::from_millis(2500));
        assert_eq!(timing.sync_interval, Duration::from_millis(300));
    }

    #[test]
    fn test_exit_display() {
        assert_eq!(WorkerExit::StopRequested.to_string(), "stop requested");
        assert_eq!(WorkerExit::AuthRejected.to_string(), "authentication rejected");
    }

    #[test]
    fn test_first_valid_id_wins_in_drive_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut mounted = MountedVolumes::new();
        for (slot, name) in [(3u8, "d"), (4, "e"), (5, "f")] {
            let root = dir.path().join(name);
            fs::create_dir(&root).unwrap();
            mounted.insert(slot, root);
        }
        let volumes = mounted.selected_volumes(DriveMask::from_letters("DEF"));

        fs::write(volumes[0].root.join("nesyskey.txt"), b"garbage").unwrap();
        write_id_file(&id_file_path(&volumes[2].root), ProfileId::new(0xF)).unwrap();
        write_id_file(&id_file_path(&volumes[1].root), ProfileId::new(0xE)).unwrap();

        assert_eq!(find_id_on_volumes(&volumes), Some(ProfileId::new(0xE)));

        // D held garbage and F a different id, E is left alone
        assert_eq!(save_id_on_volumes(&volumes, ProfileId::new(0xE)), 2);
        assert_eq!(save_id_on_volumes(&volumes, ProfileId::new(0xE)), 0);
        for volume in &volumes {
            assert_eq!(
                read_id_file(&id_file_path(&volume.root)).unwrap(),
                ProfileId::new(0xE)
            );
        }
    }

    #[tokio::test]
    async fn test_id_file_io_on_blocking_pool() {
        let dir = tempfile::tempdir().unwrap();
        let volumes = vec![Volume {
            slot: 3,
            root: dir.path().to_path_buf(),
        }];
        let id = ProfileId::new(0xD);
        let written = match on_volumes(&volumes, move |v| save_id_on_volumes(v, id)).await {
            Ok(written) => written,
            Err(_) => panic!("drive task failed"),
        };
        assert_eq!(written, 1);
        let found = match on_volumes(&volumes, find_id_on_volumes).await {
            Ok(found) => found,
            Err(_) => panic!("drive task failed"),
        };
        assert_eq!(found, Some(id));
    }

    #[test]
    fn test_no_id_on_empty_volumes() {
        let dir = tempfile::tempdir().unwrap();
        let volumes = vec![Volume {
            slot: 0,
            root: dir.path().to_path_buf(),
        }];
        assert_eq!(find_id_on_volumes(&volumes), None);
    }
}
