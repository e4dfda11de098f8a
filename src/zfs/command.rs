//! Pure argv builders for ZFS operations.
//!
//! Mapping a structured transfer intent to a command line is kept free of
//! I/O so the executor and transport can be tested against a scripted
//! runner.

/// Structured intent for a `zfs send` stream.
#[derive(Debug, Clone, Default)]
pub struct SendSpec {
    pub dataset: String,
    pub snapshot: String,
    /// Incremental base; `-I dataset@base` when present.
    pub from_snapshot: Option<String>,
    pub recursive: bool,
    /// `-w`: raw stream, preserves encryption on the wire.
    pub raw: bool,
    /// `-c`: stream blocks as compressed on disk.
    pub compressed: bool,
    /// `-t <token>`: continue an interrupted send. Takes precedence over
    /// every other flag.
    pub resume_token: Option<String>,
}

/// Structured intent for a `zfs receive` sink.
#[derive(Debug, Clone)]
pub struct ReceiveSpec {
    pub dataset: String,
    /// `-F`: roll back the destination to the most recent snapshot first.
    pub force: bool,
    /// `-s`: save state on interruption so the send can be resumed.
    pub resumable: bool,
}

impl Default for ReceiveSpec {
    fn default() -> Self {
        Self {
            dataset: String::new(),
            force: true,
            resumable: true,
        }
    }
}

pub fn send(spec: &SendSpec) -> Vec<String> {
    let mut cmd = vec!["zfs".to_string(), "send".to_string()];

    if let Some(token) = &spec.resume_token {
        cmd.push("-t".to_string());
        cmd.push(token.clone());
        return cmd;
    }

    if spec.raw {
        cmd.push("-w".to_string());
    }
    if spec.compressed {
        cmd.push("-c".to_string());
    }
    if spec.recursive {
        cmd.push("-R".to_string());
    }
    if let Some(base) = &spec.from_snapshot {
        cmd.push("-I".to_string());
        cmd.push(format!("{}@{}", spec.dataset, base));
    }

    cmd.push(format!("{}@{}", spec.dataset, spec.snapshot));
    cmd
}

/// Dry-run with parseable output, for size estimation.
pub fn send_estimate(spec: &SendSpec) -> Vec<String> {
    let mut cmd = vec![
        "zfs".to_string(),
        "send".to_string(),
        "-nvP".to_string(),
    ];

    if spec.raw {
        cmd.push("-w".to_string());
    }
    if spec.compressed {
        cmd.push("-c".to_string());
    }
    if spec.recursive {
        cmd.push("-R".to_string());
    }
    if let Some(base) = &spec.from_snapshot {
        cmd.push("-I".to_string());
        cmd.push(format!("{}@{}", spec.dataset, base));
    }

    cmd.push(format!("{}@{}", spec.dataset, spec.snapshot));
    cmd
}

pub fn receive(spec: &ReceiveSpec) -> Vec<String> {
    let mut cmd = vec!["zfs".to_string(), "receive".to_string()];

    if spec.force {
        cmd.push("-F".to_string());
    }
    if spec.resumable {
        cmd.push("-s".to_string());
    }

    cmd.push(spec.dataset.clone());
    cmd
}

pub fn dataset_exists(dataset: &str) -> Vec<String> {
    vec![
        "zfs".to_string(),
        "list".to_string(),
        "-H".to_string(),
        dataset.to_string(),
    ]
}

pub fn snapshot_exists(dataset: &str, snapshot: &str) -> Vec<String> {
    vec![
        "zfs".to_string(),
        "list".to_string(),
        "-t".to_string(),
        "snapshot".to_string(),
        "-H".to_string(),
        format!("{dataset}@{snapshot}"),
    ]
}

pub fn list_snapshots(dataset: &str) -> Vec<String> {
    vec![
        "zfs".to_string(),
        "list".to_string(),
        "-t".to_string(),
        "snapshot".to_string(),
        "-H".to_string(),
        "-o".to_string(),
        "name".to_string(),
        "-s".to_string(),
        "creation".to_string(),
        "-d".to_string(),
        "1".to_string(),
        dataset.to_string(),
    ]
}

pub fn get_property(dataset: &str, property: &str) -> Vec<String> {
    vec![
        "zfs".to_string(),
        "get".to_string(),
        "-H".to_string(),
        "-o".to_string(),
        "value".to_string(),
        property.to_string(),
        dataset.to_string(),
    ]
}

pub fn hold(dataset: &str, snapshot: &str, tag: &str) -> Vec<String> {
    vec![
        "zfs".to_string(),
        "hold".to_string(),
        tag.to_string(),
        format!("{dataset}@{snapshot}"),
    ]
}

pub fn release(dataset: &str, snapshot: &str, tag: &str) -> Vec<String> {
    vec![
        "zfs".to_string(),
        "release".to_string(),
        tag.to_string(),
        format!("{dataset}@{snapshot}"),
    ]
}

pub fn holds(dataset: &str, snapshot: &str) -> Vec<String> {
    vec![
        "zfs".to_string(),
        "holds".to_string(),
        "-H".to_string(),
        format!("{dataset}@{snapshot}"),
    ]
}
