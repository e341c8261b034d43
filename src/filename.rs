//! File-role classification from engine file names.
//!
//! The engine names its files by convention: sstables end in `.sst`, the
//! write-ahead log ends in `.log`, the manifest starts with `MANIFEST` and
//! the identity file is the literal `IDENTITY`. The router dispatches every
//! filesystem operation on the leaf name alone, so classification must be a
//! cheap pure function with no failure mode.

/// Role of an engine file, derived from its leaf name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// An immutable sorted-string table (`<number>.sst`).
    Sst,
    /// The engine's versioned-state log (`MANIFEST-<number>` or `MANIFEST`).
    Manifest,
    /// The write-ahead log (`<number>.log`).
    WriteAheadLog,
    /// The sentinel `IDENTITY` file holding the engine's unique id.
    Identity,
    /// Anything else: `CURRENT`, lock files, directory markers, options files.
    Other,
}

/// Everything the router needs to know about a file, from a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub kind: FileKind,
    /// The numeric sequence embedded in the name, when the convention has one.
    pub number: Option<u64>,
}

impl FileInfo {
    /// Classify a path. Only the leaf name participates.
    pub fn parse(path: &str) -> FileInfo {
        let leaf = basename(path);
        if let Some(stem) = leaf.strip_suffix(".sst") {
            return FileInfo {
                kind: FileKind::Sst,
                number: parse_number(stem),
            };
        }
        if let Some(stem) = leaf.strip_suffix(".log") {
            return FileInfo {
                kind: FileKind::WriteAheadLog,
                number: parse_number(stem),
            };
        }
        if leaf.starts_with("MANIFEST") {
            let number = leaf.strip_prefix("MANIFEST-").and_then(parse_number);
            return FileInfo {
                kind: FileKind::Manifest,
                number,
            };
        }
        if leaf.starts_with("IDENTITY") {
            return FileInfo {
                kind: FileKind::Identity,
                number: None,
            };
        }
        FileInfo {
            kind: FileKind::Other,
            number: None,
        }
    }

    /// Files that flow through the streaming log tier when local log files
    /// are disabled. The manifest is both a cloud-uploaded file and a
    /// log-tier file; which path wins depends on the environment options.
    pub fn is_log_routed(&self) -> bool {
        matches!(self.kind, FileKind::WriteAheadLog | FileKind::Manifest)
    }

    /// Files whose durable home is the object store.
    pub fn is_cloud_stored(&self) -> bool {
        matches!(
            self.kind,
            FileKind::Sst | FileKind::Manifest | FileKind::Identity
        )
    }

    /// A stable id usable as a persistent-cache key: the varint encoding of
    /// the file number. Empty when the role carries no number.
    pub fn unique_id(&self) -> Vec<u8> {
        match self.number {
            Some(n) => encode_varint64(n),
            None => Vec::new(),
        }
    }
}

/// Strip any directory components, returning the leaf name.
pub fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

fn parse_number(stem: &str) -> Option<u64> {
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// Varint encoding of a u64, least-significant group first.
pub fn encode_varint64(mut v: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(10);
    while v >= 0x80 {
        out.push((v as u8) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
    out
}
