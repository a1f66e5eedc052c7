//! JSON-file store: one directory per swarm under a data root.
//!
//! Layout:
//! ```text
//! <root>/swarms/<swarm_id>/swarm.json
//! <root>/swarms/<swarm_id>/memberships.json
//! <root>/swarms/<swarm_id>/group.json
//! <root>/swarms/<swarm_id>/log.json        (checksummed entries)
//! <root>/swarms/<swarm_id>/votes.json
//! <root>/swarms/<swarm_id>/vote_responses.json
//! <root>/swarms/<swarm_id>/events.json
//! <root>/messages/<channel>.json
//! ```
//!
//! Log entries carry a SHA-256 checksum over their serialized form so a
//! flipped bit surfaces as `StateError::Corrupt` at load time instead of a
//! silent log-matching violation.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use hive_protocol::{
    ConsensusGroupRecord, Event, LogEntry, LogIndex, Membership, Message, Swarm, SwarmId, Vote,
    VoteId, VoteResponse,
};

use crate::store::SwarmStore;
use crate::StateError;

#[derive(Serialize, Deserialize)]
struct ChecksummedEntry {
    checksum: String,
    entry: LogEntry,
}

/// File-backed store. All writes are serialized through one lock; files are
/// written whole (the records are small).
pub struct JsonStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StateError> {
        let root = root.into();
        fs::create_dir_all(root.join("swarms"))?;
        fs::create_dir_all(root.join("messages"))?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    /// Platform data directory, e.g. `~/.local/share/hive` on Linux.
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hive")
    }

    fn swarm_dir(&self, swarm_id: &SwarmId) -> PathBuf {
        self.root.join("swarms").join(swarm_id.to_string())
    }

    fn channel_path(&self, channel: &str) -> PathBuf {
        let safe: String = channel
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.root.join("messages").join(format!("{safe}.json"))
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), StateError> {
        let _guard = self.write_lock.lock().expect("store lock");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(value)?;
        // Write-then-rename so a crash mid-write never leaves a torn file.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn read_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &Path,
    ) -> Result<Option<T>, StateError> {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn entry_checksum(entry: &LogEntry) -> Result<String, StateError> {
        let bytes = serde_json::to_vec(entry)?;
        let digest = Sha256::digest(&bytes);
        Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
    }

    fn read_checksummed_log(&self, swarm_id: &SwarmId) -> Result<Vec<ChecksummedEntry>, StateError> {
        Ok(self
            .read_json::<Vec<ChecksummedEntry>>(&self.swarm_dir(swarm_id).join("log.json"))?
            .unwrap_or_default())
    }
}

impl SwarmStore for JsonStore {
    fn save_swarm(&self, swarm: &Swarm) -> Result<(), StateError> {
        self.write_json(&self.swarm_dir(&swarm.id).join("swarm.json"), swarm)
    }

    fn load_swarms(&self) -> Result<Vec<Swarm>, StateError> {
        let mut swarms = Vec::new();
        for dir in fs::read_dir(self.root.join("swarms"))? {
            let path = dir?.path().join("swarm.json");
            if let Some(swarm) = self.read_json::<Swarm>(&path)? {
                swarms.push(swarm);
            }
        }
        Ok(swarms)
    }

    fn save_membership(&self, membership: &Membership) -> Result<(), StateError> {
        let path = self.swarm_dir(&membership.swarm_id).join("memberships.json");
        let mut all = self
            .read_json::<Vec<Membership>>(&path)?
            .unwrap_or_default();
        match all.iter_mut().find(|m| m.agent_id == membership.agent_id) {
            Some(existing) => *existing = membership.clone(),
            None => all.push(membership.clone()),
        }
        self.write_json(&path, &all)
    }

    fn load_memberships(&self, swarm_id: &SwarmId) -> Result<Vec<Membership>, StateError> {
        Ok(self
            .read_json(&self.swarm_dir(swarm_id).join("memberships.json"))?
            .unwrap_or_default())
    }

    fn save_group(&self, group: &ConsensusGroupRecord) -> Result<(), StateError> {
        self.write_json(&self.swarm_dir(&group.swarm_id).join("group.json"), group)
    }

    fn load_group(&self, swarm_id: &SwarmId) -> Result<Option<ConsensusGroupRecord>, StateError> {
        self.read_json(&self.swarm_dir(swarm_id).join("group.json"))
    }

    fn append_log_entries(
        &self,
        swarm_id: &SwarmId,
        entries: &[LogEntry],
    ) -> Result<(), StateError> {
        let mut log = self.read_checksummed_log(swarm_id)?;
        for entry in entries {
            log.push(ChecksummedEntry {
                checksum: Self::entry_checksum(entry)?,
                entry: entry.clone(),
            });
        }
        self.write_json(&self.swarm_dir(swarm_id).join("log.json"), &log)
    }

    fn truncate_log_from(&self, swarm_id: &SwarmId, from: LogIndex) -> Result<(), StateError> {
        let mut log = self.read_checksummed_log(swarm_id)?;
        log.retain(|c| c.entry.index < from);
        self.write_json(&self.swarm_dir(swarm_id).join("log.json"), &log)
    }

    fn load_log(&self, swarm_id: &SwarmId) -> Result<Vec<LogEntry>, StateError> {
        let log = self.read_checksummed_log(swarm_id)?;
        let mut entries = Vec::with_capacity(log.len());
        for checksummed in log {
            let recomputed = Self::entry_checksum(&checksummed.entry)?;
            if recomputed != checksummed.checksum {
                return Err(StateError::Corrupt(format!(
                    "checksum mismatch at log index {} for swarm {swarm_id}",
                    checksummed.entry.index
                )));
            }
            entries.push(checksummed.entry);
        }
        Ok(entries)
    }

    fn save_vote(&self, vote: &Vote) -> Result<(), StateError> {
        let path = self.swarm_dir(&vote.swarm_id).join("votes.json");
        let mut all = self.read_json::<Vec<Vote>>(&path)?.unwrap_or_default();
        match all.iter_mut().find(|v| v.id == vote.id) {
            Some(existing) => *existing = vote.clone(),
            None => all.push(vote.clone()),
        }
        self.write_json(&path, &all)
    }

    fn save_vote_response(&self, response: &VoteResponse) -> Result<(), StateError> {
        // Responses are append-only audit rows; one flat file is enough.
        let path = self.root.join("vote_responses.json");
        let mut all = self
            .read_json::<Vec<VoteResponse>>(&path)?
            .unwrap_or_default();
        all.push(response.clone());
        self.write_json(&path, &all)
    }

    fn load_votes(&self, swarm_id: &SwarmId) -> Result<Vec<Vote>, StateError> {
        Ok(self
            .read_json(&self.swarm_dir(swarm_id).join("votes.json"))?
            .unwrap_or_default())
    }

    fn load_vote_responses(&self, vote_id: &VoteId) -> Result<Vec<VoteResponse>, StateError> {
        let all = self
            .read_json::<Vec<VoteResponse>>(&self.root.join("vote_responses.json"))?
            .unwrap_or_default();
        Ok(all.into_iter().filter(|r| r.vote_id == *vote_id).collect())
    }

    fn save_message(&self, message: &Message) -> Result<(), StateError> {
        let path = self.channel_path(&message.channel);
        let mut all = self.read_json::<Vec<Message>>(&path)?.unwrap_or_default();
        match all.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message.clone(),
            None => all.push(message.clone()),
        }
        self.write_json(&path, &all)
    }

    fn load_messages(&self, channel: &str) -> Result<Vec<Message>, StateError> {
        Ok(self
            .read_json(&self.channel_path(channel))?
            .unwrap_or_default())
    }

    fn load_all_messages(&self) -> Result<Vec<Message>, StateError> {
        let mut all = Vec::new();
        for file in fs::read_dir(self.root.join("messages"))? {
            let path = file?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(messages) = self.read_json::<Vec<Message>>(&path)? {
                all.extend(messages);
            }
        }
        Ok(all)
    }

    fn save_event(&self, event: &Event) -> Result<(), StateError> {
        let path = self.swarm_dir(&event.swarm_id).join("events.json");
        let mut all = self.read_json::<Vec<Event>>(&path)?.unwrap_or_default();
        match all.iter_mut().find(|e| e.id == event.id) {
            Some(existing) => *existing = event.clone(),
            None => all.push(event.clone()),
        }
        self.write_json(&path, &all)
    }

    fn load_events(&self, swarm_id: &SwarmId) -> Result<Vec<Event>, StateError> {
        Ok(self
            .read_json(&self.swarm_dir(swarm_id).join("events.json"))?
            .unwrap_or_default())
    }

    fn load_all_events(&self) -> Result<Vec<Event>, StateError> {
        let mut all = Vec::new();
        for dir in fs::read_dir(self.root.join("swarms"))? {
            let path = dir?.path().join("events.json");
            if let Some(events) = self.read_json::<Vec<Event>>(&path)? {
                all.extend(events);
            }
        }
        Ok(all)
    }
}
