// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hash-chained append-only audit log.
//!
//! Each line is a JSON event whose hash covers the previous hash and the
//! event serialized with an empty `hash` field. The genesis `prev` is 32 zero
//! bytes. Any edit to a line breaks every hash after it.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub time: DateTime<Utc>,
    pub kind: String,
    pub actor: String,
    pub target: String,
    pub meta: BTreeMap<String, String>,
    pub prev: String,
    pub hash: String,
}

struct WriterState {
    file: File,
    prev: [u8; 32],
}

/// Appends chained events to a log file. One writer per file.
pub struct AuditWriter {
    state: Mutex<WriterState>,
}

impl AuditWriter {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            state: Mutex::new(WriterState {
                file,
                prev: [0; 32],
            }),
        })
    }

    pub fn log(
        &self,
        kind: &str,
        actor: &str,
        target: &str,
        meta: BTreeMap<String, String>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let mut event = AuditEvent {
            time: Utc::now(),
            kind: kind.to_string(),
            actor: actor.to_string(),
            target: target.to_string(),
            meta,
            prev: hex::encode(state.prev),
            hash: String::new(),
        };

        let canonical = serde_json::to_vec(&event)?;
        let mut hasher = Sha256::new();
        hasher.update(state.prev);
        hasher.update(&canonical);
        let digest: [u8; 32] = hasher.finalize().into();
        event.hash = hex::encode(digest);

        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        state.file.write_all(&line)?;
        state.prev = digest;
        Ok(())
    }
}

/// Verification outcome. `first_break` is the 1-based line number of the
/// first entry that fails the chain, with a reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyOutcome {
    pub entries: usize,
    pub first_break: Option<(usize, String)>,
}

impl VerifyOutcome {
    pub fn is_intact(&self) -> bool {
        self.first_break.is_none()
    }
}

/// Replay the log and recompute every hash.
pub fn verify(path: &Path) -> Result<VerifyOutcome> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);

    let mut prev = [0u8; 32];
    let mut entries = 0;
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        entries += 1;
        let lineno = idx + 1;

        let mut event: AuditEvent = match serde_json::from_str(&line) {
            Ok(ev) => ev,
            Err(err) => {
                return Ok(VerifyOutcome {
                    entries,
                    first_break: Some((lineno, format!("unparseable entry: {}", err))),
                });
            }
        };

        if event.prev != hex::encode(prev) {
            return Ok(VerifyOutcome {
                entries,
                first_break: Some((lineno, "prev does not match preceding hash".to_string())),
            });
        }

        let recorded = std::mem::take(&mut event.hash);
        let canonical = serde_json::to_vec(&event)?;
        let mut hasher = Sha256::new();
        hasher.update(prev);
        hasher.update(&canonical);
        let digest: [u8; 32] = hasher.finalize().into();

        if recorded != hex::encode(digest) {
            return Ok(VerifyOutcome {
                entries,
                first_break: Some((lineno, "hash mismatch".to_string())),
            });
        }
        prev = digest;
    }

    Ok(VerifyOutcome {
        entries,
        first_break: None,
    })
}
