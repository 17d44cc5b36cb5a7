//! Chunk assembler.
//!
//! Accumulates streamed partial content into one in-flight
//! [`StreamingUnit`] per session and seals it when a terminal chunk
//! arrives. Chunks are applied in the order they are handed in; ordering
//! across the wire is the transport's responsibility. Buffers grow without
//! bound within a unit.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::session::SessionId;

/// Who produced a unit's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitRole {
    /// A chat message typed by the user.
    User,
    /// A streamed chat reply.
    Assistant,
    /// A terminal command line sent by the user.
    Command,
    /// Streamed terminal output.
    Output,
}

/// One streamed exchange: in progress, then sealed and immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingUnit {
    /// Unit id (server-assigned when the stream carries one).
    pub id: String,
    /// Owning session.
    pub session_id: SessionId,
    /// Producer of the content.
    pub role: UnitRole,
    /// Accumulated content.
    pub content: String,
    /// First chunk time (Unix millis).
    pub started_at: u64,
    /// Seal time (Unix millis).
    #[serde(default)]
    pub finished_at: Option<u64>,
    /// `finished_at - started_at`.
    #[serde(default)]
    pub duration_ms: Option<u64>,
    /// Sealed flag.
    #[serde(default)]
    pub completed: bool,
    /// Exit code for terminal commands.
    #[serde(default)]
    pub exit_code: Option<i32>,
}

impl StreamingUnit {
    /// Starts an open unit.
    pub fn open(
        session_id: impl Into<SessionId>,
        role: UnitRole,
        id: Option<String>,
        now: u64,
    ) -> Self {
        Self {
            id: id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            session_id: session_id.into(),
            role,
            content: String::new(),
            started_at: now,
            finished_at: None,
            duration_ms: None,
            completed: false,
            exit_code: None,
        }
    }

    /// A unit that is complete at creation (optimistic user messages,
    /// recorded commands).
    pub fn sealed(
        session_id: impl Into<SessionId>,
        role: UnitRole,
        content: impl Into<String>,
        now: u64,
    ) -> Self {
        let mut unit = Self::open(session_id, role, None, now);
        unit.content = content.into();
        unit.seal(now);
        unit
    }

    fn seal(&mut self, now: u64) {
        self.completed = true;
        self.finished_at = Some(now);
        self.duration_ms = Some(now.saturating_sub(self.started_at));
    }
}

/// What a chunk did to the assembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Nothing changed (empty finish with no open unit, or a repeated seal).
    Ignored,
    /// Empty non-terminal chunk: buffer untouched, liveness only.
    KeepAlive,
    /// A new unit was opened; snapshot attached.
    Started(StreamingUnit),
    /// Content was appended; snapshot attached.
    Appended(StreamingUnit),
    /// The unit was sealed and removed from the in-flight slot.
    Sealed(StreamingUnit),
}

/// A chunk handed to the assembler.
#[derive(Debug, Clone, Copy)]
pub struct Chunk<'a> {
    /// Content delta (may be empty).
    pub content: &'a str,
    /// Terminal flag.
    pub finished: bool,
    /// Server-assigned unit id.
    pub unit_id: Option<&'a str>,
    /// Exit code recorded on seal.
    pub exit_code: Option<i32>,
}

impl<'a> Chunk<'a> {
    /// A chunk with no id or exit code.
    pub fn new(content: &'a str, finished: bool) -> Self {
        Self {
            content,
            finished,
            unit_id: None,
            exit_code: None,
        }
    }
}

/// The chunk that sealed a session's most recent unit.
#[derive(Debug, Clone)]
struct SealMark {
    unit_id: String,
    final_chunk: String,
}

/// Holds the in-flight unit of every session.
#[derive(Debug, Default)]
pub struct ChunkAssembler {
    in_flight: HashMap<SessionId, StreamingUnit>,
    last_sealed: HashMap<SessionId, SealMark>,
}

impl ChunkAssembler {
    /// Creates an empty assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one chunk for `session_id`. `role` is used only when a new
    /// unit is opened.
    pub fn on_chunk(
        &mut self,
        session_id: &str,
        role: UnitRole,
        chunk: Chunk<'_>,
        now: u64,
    ) -> ChunkOutcome {
        if chunk.finished && self.is_repeat_seal(session_id, &chunk) {
            tracing::debug!(
                session_id = %session_id,
                unit_id = ?chunk.unit_id,
                "Ignoring repeated terminal chunk"
            );
            return ChunkOutcome::Ignored;
        }
        if !chunk.content.is_empty() {
            self.last_sealed.remove(session_id);
        }

        let started = match self.in_flight.get_mut(session_id) {
            Some(unit) => {
                if !chunk.content.is_empty() {
                    unit.content.push_str(chunk.content);
                } else if !chunk.finished {
                    return ChunkOutcome::KeepAlive;
                }
                false
            }
            None => {
                if chunk.content.is_empty() {
                    return if chunk.finished {
                        ChunkOutcome::Ignored
                    } else {
                        ChunkOutcome::KeepAlive
                    };
                }
                let mut unit = StreamingUnit::open(
                    session_id,
                    role,
                    chunk.unit_id.map(str::to_string),
                    now,
                );
                unit.content.push_str(chunk.content);
                self.in_flight.insert(session_id.to_string(), unit);
                true
            }
        };

        if chunk.finished {
            return match self.in_flight.remove(session_id) {
                Some(mut unit) => {
                    unit.exit_code = chunk.exit_code;
                    unit.seal(now);
                    self.last_sealed.insert(
                        session_id.to_string(),
                        SealMark {
                            unit_id: unit.id.clone(),
                            final_chunk: chunk.content.to_string(),
                        },
                    );
                    ChunkOutcome::Sealed(unit)
                }
                None => ChunkOutcome::Ignored,
            };
        }

        match self.in_flight.get(session_id) {
            Some(unit) if started => ChunkOutcome::Started(unit.clone()),
            Some(unit) => ChunkOutcome::Appended(unit.clone()),
            None => ChunkOutcome::Ignored,
        }
    }

    /// A terminal chunk repeats the last seal when nothing is in flight and
    /// no content arrived since. With a unit id the ids must match; without
    /// one the content must equal the chunk that sealed.
    fn is_repeat_seal(&self, session_id: &str, chunk: &Chunk<'_>) -> bool {
        if self.in_flight.contains_key(session_id) {
            return false;
        }
        match (chunk.unit_id, self.last_sealed.get(session_id)) {
            (Some(id), Some(mark)) => id == mark.unit_id,
            (None, Some(mark)) => chunk.content == mark.final_chunk,
            (_, None) => false,
        }
    }

    /// Drops the in-flight unit of a session. Returns true if one existed.
    pub fn reset(&mut self, session_id: &str) -> bool {
        let dropped = self.in_flight.remove(session_id);
        if let Some(unit) = &dropped {
            tracing::debug!(
                session_id = %session_id,
                buffered = unit.content.len(),
                "Dropped partial unit"
            );
        }
        dropped.is_some()
    }

    /// Forgets everything about a session.
    pub fn forget(&mut self, session_id: &str) {
        self.in_flight.remove(session_id);
        self.last_sealed.remove(session_id);
    }

    /// The in-flight unit of a session.
    pub fn in_flight(&self, session_id: &str) -> Option<&StreamingUnit> {
        self.in_flight.get(session_id)
    }

    /// Number of sessions with an open unit.
    pub fn open_count(&self) -> usize {
        self.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(content: &str, finished: bool) -> Chunk<'_> {
        Chunk::new(content, finished)
    }

    #[test]
    fn test_hello_assembles_in_order() {
        let mut assembler = ChunkAssembler::new();
        let first = assembler.on_chunk("s1", UnitRole::Assistant, chunk("Hel", false), 10);
        assert!(matches!(first, ChunkOutcome::Started(ref u) if u.content == "Hel"));

        let sealed = assembler.on_chunk("s1", UnitRole::Assistant, chunk("lo", true), 25);
        match sealed {
            ChunkOutcome::Sealed(unit) => {
                assert_eq!(unit.content, "Hello");
                assert!(unit.completed);
                assert_eq!(unit.started_at, 10);
                assert_eq!(unit.finished_at, Some(25));
                assert_eq!(unit.duration_ms, Some(15));
            }
            other => panic!("expected seal, got {:?}", other),
        }
        assert!(assembler.in_flight("s1").is_none());
    }

    #[test]
    fn test_empty_finish_without_unit_is_noop() {
        let mut assembler = ChunkAssembler::new();
        let outcome = assembler.on_chunk("s1", UnitRole::Assistant, chunk("", true), 1);
        assert_eq!(outcome, ChunkOutcome::Ignored);
        assert_eq!(assembler.open_count(), 0);
    }

    #[test]
    fn test_keep_alive_leaves_buffer() {
        let mut assembler = ChunkAssembler::new();
        assert_eq!(
            assembler.on_chunk("s1", UnitRole::Output, chunk("", false), 1),
            ChunkOutcome::KeepAlive
        );
        assert!(assembler.in_flight("s1").is_none());

        assembler.on_chunk("s1", UnitRole::Output, chunk("abc", false), 2);
        assert_eq!(
            assembler.on_chunk("s1", UnitRole::Output, chunk("", false), 3),
            ChunkOutcome::KeepAlive
        );
        assert_eq!(assembler.in_flight("s1").unwrap().content, "abc");
    }

    #[test]
    fn test_empty_finish_seals_open_unit() {
        let mut assembler = ChunkAssembler::new();
        assembler.on_chunk("s1", UnitRole::Assistant, chunk("done", false), 1);
        let outcome = assembler.on_chunk("s1", UnitRole::Assistant, chunk("", true), 2);
        assert!(matches!(outcome, ChunkOutcome::Sealed(ref u) if u.content == "done"));
    }

    #[test]
    fn test_single_chunk_reply() {
        let mut assembler = ChunkAssembler::new();
        let outcome = assembler.on_chunk("s1", UnitRole::Assistant, chunk("ok", true), 5);
        assert!(matches!(outcome, ChunkOutcome::Sealed(ref u) if u.content == "ok"));
    }

    #[test]
    fn test_repeated_terminal_chunk_is_ignored() {
        let mut assembler = ChunkAssembler::new();
        fn with_id(content: &'static str, finished: bool) -> Chunk<'static> {
            Chunk {
                content,
                finished,
                unit_id: Some("m-1"),
                exit_code: None,
            }
        }
        assembler.on_chunk("s1", UnitRole::Assistant, with_id("Hel", false), 1);
        let first = assembler.on_chunk("s1", UnitRole::Assistant, with_id("lo", true), 2);
        assert!(matches!(first, ChunkOutcome::Sealed(ref u) if u.id == "m-1"));

        let again = assembler.on_chunk("s1", UnitRole::Assistant, with_id("lo", true), 3);
        assert_eq!(again, ChunkOutcome::Ignored);
        assert!(assembler.in_flight("s1").is_none());
    }

    #[test]
    fn test_repeated_terminal_chunk_without_id_is_ignored() {
        let mut assembler = ChunkAssembler::new();
        assembler.on_chunk("s1", UnitRole::Assistant, chunk("Hel", false), 1);
        let first = assembler.on_chunk("s1", UnitRole::Assistant, chunk("lo", true), 2);
        assert!(matches!(first, ChunkOutcome::Sealed(ref u) if u.content == "Hello"));

        assert_eq!(
            assembler.on_chunk("s1", UnitRole::Assistant, chunk("lo", true), 3),
            ChunkOutcome::Ignored
        );
        assert!(assembler.in_flight("s1").is_none());

        // New content ends the repeat window
        let next = assembler.on_chunk("s1", UnitRole::Assistant, chunk("x", false), 4);
        assert!(matches!(next, ChunkOutcome::Started(ref u) if u.content == "x"));
    }

    #[test]
    fn test_same_reply_after_new_content_is_sealed_again() {
        let mut assembler = ChunkAssembler::new();
        assembler.on_chunk("s1", UnitRole::Assistant, chunk("ok", true), 1);
        assembler.on_chunk("s1", UnitRole::Assistant, chunk("again ", false), 2);
        let outcome = assembler.on_chunk("s1", UnitRole::Assistant, chunk("ok", true), 3);
        assert!(matches!(outcome, ChunkOutcome::Sealed(ref u) if u.content == "again ok"));
    }

    #[test]
    fn test_different_unit_id_is_not_a_repeat() {
        let mut assembler = ChunkAssembler::new();
        let first = Chunk {
            content: "ok",
            finished: true,
            unit_id: Some("m-1"),
            exit_code: None,
        };
        let second = Chunk {
            unit_id: Some("m-2"),
            ..first
        };
        assembler.on_chunk("s1", UnitRole::Assistant, first, 1);
        let outcome = assembler.on_chunk("s1", UnitRole::Assistant, second, 2);
        assert!(matches!(outcome, ChunkOutcome::Sealed(ref u) if u.id == "m-2"));
    }

    #[test]
    fn test_sessions_are_independent() {
        let mut assembler = ChunkAssembler::new();
        assembler.on_chunk("s1", UnitRole::Output, chunk("one", false), 1);
        assembler.on_chunk("s2", UnitRole::Output, chunk("two", false), 1);
        assembler.on_chunk("s1", UnitRole::Output, chunk("!", false), 2);

        assert_eq!(assembler.in_flight("s1").unwrap().content, "one!");
        assert_eq!(assembler.in_flight("s2").unwrap().content, "two");
    }

    #[test]
    fn test_reset_drops_partial() {
        let mut assembler = ChunkAssembler::new();
        assembler.on_chunk("s1", UnitRole::Output, chunk("Wor", false), 1);
        assert!(assembler.reset("s1"));
        assert!(!assembler.reset("s1"));
        assert!(assembler.in_flight("s1").is_none());
    }

    #[test]
    fn test_exit_code_recorded_on_seal() {
        let mut assembler = ChunkAssembler::new();
        assembler.on_chunk("s1", UnitRole::Output, chunk("ls\n", false), 1);
        let outcome = assembler.on_chunk(
            "s1",
            UnitRole::Output,
            Chunk {
                content: "",
                finished: true,
                unit_id: None,
                exit_code: Some(1),
            },
            2,
        );
        assert!(matches!(outcome, ChunkOutcome::Sealed(ref u) if u.exit_code == Some(1)));
    }

    #[test]
    fn test_sealed_constructor() {
        let unit = StreamingUnit::sealed("s1", UnitRole::User, "hi", 9);
        assert!(unit.completed);
        assert_eq!(unit.duration_ms, Some(0));
        assert!(!unit.id.is_empty());
    }
}
