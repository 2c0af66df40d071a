//! Static topology: process groups, their states, and per-process startup
//! configuration.
//!
//! Two representations exist. The *authoring document* is strict JSON
//! (unknown fields are rejected) and is what integrators edit; it compiles
//! into the *flat blob*, a versioned, length-prefixed binary image that the
//! daemon loads at startup from the path named by `LIFELINE_CONFIG`. The
//! daemon never parses JSON.
//!
//! Load is strict across the board: bad magic, unsupported version, counts
//! over the compiled-in limits, out-of-range indices, identifier-hash
//! collisions, cyclic start dependencies, and trailing bytes all abort
//! initialization.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ident::Identifier;

/// Environment variable naming the blob path.
pub const CONFIG_PATH_ENV: &str = "LIFELINE_CONFIG";

pub const MAX_ARGV: usize = 32;
pub const MAX_ENVP: usize = 64;
/// Upper bound on processes across all groups; also sizes the pid map and
/// the job queue.
pub const MAX_PROCESSES: usize = 1024;
/// Worker threads executing graph nodes.
pub const NUM_WORKER_THREADS: usize = 4;

const BLOB_MAGIC: u32 = 0x4C46_4C4E; // "LFLN"
const BLOB_VERSION: u32 = 1;

// ─── Runtime model ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedPolicy {
    Fifo,
    RoundRobin,
    Other,
}

/// How a launched process talks back to the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommsType {
    /// No channel; considered running once the fork has returned and the
    /// child has not already exited.
    None,
    /// Reports running over the shared comms segment.
    Reporting,
    /// A state manager: comms segment plus a control channel.
    StateManager,
    /// The entry represents the manager itself; never forked.
    SelfManager,
}

/// State a dependency predecessor must have reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequiredState {
    Running,
    Terminated,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ResourceLimits {
    pub address_space: Option<u64>,
    pub stack: Option<u64>,
    pub cpu_time: Option<u64>,
    pub data: Option<u64>,
}

/// A start dependency: this process may only start once the target process
/// is in the required state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependency {
    pub process: u32,
    pub state: RequiredState,
}

#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub short_name: String,
    pub executable: PathBuf,
    pub argv: Vec<String>,
    pub envp: Vec<String>,
    pub uid: u32,
    pub gid: u32,
    pub supplementary_gids: Vec<u32>,
    pub affinity_mask: u64,
    pub sched_policy: SchedPolicy,
    pub priority: i32,
    pub limits: ResourceLimits,
    pub security_policy: Option<String>,
    pub comms: CommsType,
    pub self_terminating: bool,
    pub startup_timeout: Duration,
    pub termination_timeout: Duration,
    pub restart_attempts: u32,
    pub execution_error_code: u64,
    pub dependencies: Vec<Dependency>,
}

#[derive(Debug, Clone)]
pub struct StateConfig {
    pub name: Identifier,
    /// Indices into the owning group's process table.
    pub processes: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct GroupConfig {
    pub name: Identifier,
    pub off_state: Identifier,
    pub recovery_state: Identifier,
    pub states: Vec<StateConfig>,
    pub processes: Vec<ProcessConfig>,
}

impl GroupConfig {
    pub fn state(&self, name: Identifier) -> Option<&StateConfig> {
        self.states.iter().find(|s| s.name == name)
    }
}

/// The loaded, validated topology.
#[derive(Debug, Clone)]
pub struct Config {
    pub groups: Vec<GroupConfig>,
    /// The machine process group driven through the initial transition.
    pub machine_group: Identifier,
    pub startup_state: Identifier,
}

impl Config {
    /// Load the blob from the path in `LIFELINE_CONFIG`.
    pub fn load() -> Result<Config, CoreError> {
        let path = std::env::var(CONFIG_PATH_ENV)
            .map_err(|_| CoreError::ConfigPathUnset(CONFIG_PATH_ENV))?;
        Self::load_path(Path::new(&path))
    }

    pub fn load_path(path: &Path) -> Result<Config, CoreError> {
        let bytes = std::fs::read(path).map_err(|source| CoreError::ConfigIo {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_blob(&bytes)
    }

    pub fn group(&self, name: Identifier) -> Option<&GroupConfig> {
        self.groups.iter().find(|g| g.name == name)
    }

    pub fn group_index(&self, name: Identifier) -> Option<usize> {
        self.groups.iter().position(|g| g.name == name)
    }

    pub fn total_processes(&self) -> usize {
        self.groups.iter().map(|g| g.processes.len()).sum()
    }

    /// Process indexes of a group state, or `None` for an unknown pair.
    pub fn process_indexes(&self, group: Identifier, state: Identifier) -> Option<&[u32]> {
        self.group(group)?
            .state(state)
            .map(|s| s.processes.as_slice())
    }

    // ─── Validation ───────────────────────────────────────────

    fn validate(&self) -> Result<(), CoreError> {
        if self.groups.is_empty() {
            return Err(CoreError::Config("no process groups".into()));
        }
        if self.total_processes() > MAX_PROCESSES {
            return Err(CoreError::Config(format!(
                "too many processes ({} > {MAX_PROCESSES})",
                self.total_processes()
            )));
        }
        if self.group(self.machine_group).is_none() {
            return Err(CoreError::NoStartupState);
        }
        let mut self_managers = 0usize;
        for group in &self.groups {
            let count = group.processes.len() as u32;
            for state in &group.states {
                if let Some(&bad) = state.processes.iter().find(|&&p| p >= count) {
                    return Err(CoreError::Config(format!(
                        "state {} of group {} references process index {bad} out of range",
                        state.name, group.name
                    )));
                }
            }
            for (index, process) in group.processes.iter().enumerate() {
                if process.argv.len() > MAX_ARGV || process.envp.len() > MAX_ENVP {
                    return Err(CoreError::Config(format!(
                        "process {} of group {} exceeds argv/envp limits",
                        process.short_name, group.name
                    )));
                }
                if process.comms == CommsType::SelfManager {
                    self_managers += 1;
                }
                for dep in &process.dependencies {
                    if dep.process >= count {
                        return Err(CoreError::Config(format!(
                            "process {} of group {} depends on out-of-range index {}",
                            process.short_name, group.name, dep.process
                        )));
                    }
                    if dep.process as usize == index {
                        return Err(CoreError::Config(format!(
                            "process {} of group {} depends on itself",
                            process.short_name, group.name
                        )));
                    }
                }
            }
            Self::reject_dependency_cycles(group)?;
        }
        if self_managers > 1 {
            return Err(CoreError::Config(
                "more than one process marked as the manager itself".into(),
            ));
        }
        Ok(())
    }

    /// A cyclic start-dependency table would deadlock every transition
    /// round, so it is rejected at load.
    fn reject_dependency_cycles(group: &GroupConfig) -> Result<(), CoreError> {
        let mut dag = DiGraph::<u32, ()>::new();
        let nodes: Vec<_> = (0..group.processes.len() as u32)
            .map(|i| dag.add_node(i))
            .collect();
        for (index, process) in group.processes.iter().enumerate() {
            for dep in &process.dependencies {
                dag.add_edge(nodes[dep.process as usize], nodes[index], ());
            }
        }
        toposort(&dag, None).map_err(|_| {
            CoreError::Config(format!("cyclic start dependencies in group {}", group.name))
        })?;
        Ok(())
    }

    // ─── Blob codec ───────────────────────────────────────────

    pub fn from_blob(bytes: &[u8]) -> Result<Config, CoreError> {
        let mut r = BlobReader::new(bytes);
        if r.u32()? != BLOB_MAGIC {
            return Err(CoreError::Config("bad configuration magic".into()));
        }
        let version = r.u32()?;
        if version != BLOB_VERSION {
            return Err(CoreError::Config(format!(
                "unsupported configuration version {version}"
            )));
        }
        let machine_group = r.ident()?;
        let startup_state = r.ident()?;
        let group_count = r.u32()? as usize;
        let mut groups = Vec::with_capacity(group_count);
        for _ in 0..group_count {
            groups.push(Self::read_group(&mut r)?);
        }
        r.finish()?;

        let config = Config {
            groups,
            machine_group,
            startup_state,
        };
        config.validate()?;
        Ok(config)
    }

    fn read_group(r: &mut BlobReader<'_>) -> Result<GroupConfig, CoreError> {
        let name = r.ident()?;
        let off_state = r.ident()?;
        let recovery_state = r.ident()?;
        let state_count = r.u32()? as usize;
        let mut states = Vec::with_capacity(state_count);
        for _ in 0..state_count {
            let state_name = r.ident()?;
            let processes = r.u32_list()?;
            states.push(StateConfig {
                name: state_name,
                processes,
            });
        }
        let process_count = r.u32()? as usize;
        let mut processes = Vec::with_capacity(process_count);
        for _ in 0..process_count {
            processes.push(Self::read_process(r)?);
        }
        Ok(GroupConfig {
            name,
            off_state,
            recovery_state,
            states,
            processes,
        })
    }

    fn read_process(r: &mut BlobReader<'_>) -> Result<ProcessConfig, CoreError> {
        let short_name = r.string()?;
        let executable = PathBuf::from(r.string()?);
        let argv = r.string_list()?;
        let envp = r.string_list()?;
        let uid = r.u32()?;
        let gid = r.u32()?;
        let supplementary_gids = r.u32_list()?;
        let affinity_mask = r.u64()?;
        let sched_policy = match r.u32()? {
            0 => SchedPolicy::Fifo,
            1 => SchedPolicy::RoundRobin,
            2 => SchedPolicy::Other,
            other => {
                return Err(CoreError::Config(format!(
                    "unknown scheduling policy {other}"
                )))
            }
        };
        let priority = r.u32()? as i32;
        let limits = ResourceLimits {
            address_space: r.opt_u64()?,
            stack: r.opt_u64()?,
            cpu_time: r.opt_u64()?,
            data: r.opt_u64()?,
        };
        let security_policy = {
            let label = r.string()?;
            (!label.is_empty()).then_some(label)
        };
        let comms = match r.u32()? {
            0 => CommsType::None,
            1 => CommsType::Reporting,
            2 => CommsType::StateManager,
            3 => CommsType::SelfManager,
            other => return Err(CoreError::Config(format!("unknown comms type {other}"))),
        };
        let self_terminating = r.u32()? != 0;
        let startup_timeout = Duration::from_millis(r.u64()?);
        let termination_timeout = Duration::from_millis(r.u64()?);
        let restart_attempts = r.u32()?;
        let execution_error_code = r.u64()?;
        let dep_count = r.u32()? as usize;
        let mut dependencies = Vec::with_capacity(dep_count);
        for _ in 0..dep_count {
            let process = r.u32()?;
            let state = match r.u32()? {
                0 => RequiredState::Running,
                1 => RequiredState::Terminated,
                other => {
                    return Err(CoreError::Config(format!(
                        "unknown dependency state {other}"
                    )))
                }
            };
            dependencies.push(Dependency { process, state });
        }
        Ok(ProcessConfig {
            short_name,
            executable,
            argv,
            envp,
            uid,
            gid,
            supplementary_gids,
            affinity_mask,
            sched_policy,
            priority,
            limits,
            security_policy,
            comms,
            self_terminating,
            startup_timeout,
            termination_timeout,
            restart_attempts,
            execution_error_code,
            dependencies,
        })
    }

    /// Encode to the flat blob. The counterpart of [`Config::from_blob`];
    /// used by the configuration compiler and by tests.
    pub fn to_blob(&self) -> Vec<u8> {
        let mut w = BlobWriter::default();
        w.u32(BLOB_MAGIC);
        w.u32(BLOB_VERSION);
        w.ident(self.machine_group);
        w.ident(self.startup_state);
        w.u32(self.groups.len() as u32);
        for group in &self.groups {
            w.ident(group.name);
            w.ident(group.off_state);
            w.ident(group.recovery_state);
            w.u32(group.states.len() as u32);
            for state in &group.states {
                w.ident(state.name);
                w.u32_list(&state.processes);
            }
            w.u32(group.processes.len() as u32);
            for p in &group.processes {
                w.string(&p.short_name);
                w.string(&p.executable.to_string_lossy());
                w.string_list(&p.argv);
                w.string_list(&p.envp);
                w.u32(p.uid);
                w.u32(p.gid);
                w.u32_list(&p.supplementary_gids);
                w.u64(p.affinity_mask);
                w.u32(match p.sched_policy {
                    SchedPolicy::Fifo => 0,
                    SchedPolicy::RoundRobin => 1,
                    SchedPolicy::Other => 2,
                });
                w.u32(p.priority as u32);
                w.opt_u64(p.limits.address_space);
                w.opt_u64(p.limits.stack);
                w.opt_u64(p.limits.cpu_time);
                w.opt_u64(p.limits.data);
                w.string(p.security_policy.as_deref().unwrap_or(""));
                w.u32(match p.comms {
                    CommsType::None => 0,
                    CommsType::Reporting => 1,
                    CommsType::StateManager => 2,
                    CommsType::SelfManager => 3,
                });
                w.u32(u32::from(p.self_terminating));
                w.u64(p.startup_timeout.as_millis() as u64);
                w.u64(p.termination_timeout.as_millis() as u64);
                w.u32(p.restart_attempts);
                w.u64(p.execution_error_code);
                w.u32(p.dependencies.len() as u32);
                for dep in &p.dependencies {
                    w.u32(dep.process);
                    w.u32(match dep.state {
                        RequiredState::Running => 0,
                        RequiredState::Terminated => 1,
                    });
                }
            }
        }
        w.bytes
    }
}

// ─── Blob primitives ──────────────────────────────────────────

struct BlobReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> BlobReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        BlobReader { bytes, offset: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CoreError> {
        let end = self
            .offset
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| CoreError::Config("truncated configuration blob".into()))?;
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, CoreError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, CoreError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn opt_u64(&mut self) -> Result<Option<u64>, CoreError> {
        Ok(match self.u32()? {
            0 => None,
            _ => Some(self.u64()?),
        })
    }

    fn string(&mut self) -> Result<String, CoreError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| CoreError::Config("non-UTF-8 string in configuration blob".into()))
    }

    /// Read a name and register it, rejecting hash collisions.
    fn ident(&mut self) -> Result<Identifier, CoreError> {
        let name = self.string()?;
        Identifier::try_new(&name)
    }

    fn u32_list(&mut self) -> Result<Vec<u32>, CoreError> {
        let count = self.u32()? as usize;
        if count > MAX_PROCESSES {
            return Err(CoreError::Config("list length over limit".into()));
        }
        (0..count).map(|_| self.u32()).collect()
    }

    fn string_list(&mut self) -> Result<Vec<String>, CoreError> {
        let count = self.u32()? as usize;
        if count > MAX_ENVP {
            return Err(CoreError::Config("list length over limit".into()));
        }
        (0..count).map(|_| self.string()).collect()
    }

    fn finish(&self) -> Result<(), CoreError> {
        if self.offset != self.bytes.len() {
            return Err(CoreError::Config(format!(
                "{} trailing bytes in configuration blob",
                self.bytes.len() - self.offset
            )));
        }
        Ok(())
    }
}

#[derive(Default)]
struct BlobWriter {
    bytes: Vec<u8>,
}

impl BlobWriter {
    fn u32(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    fn opt_u64(&mut self, v: Option<u64>) {
        match v {
            Some(v) => {
                self.u32(1);
                self.u64(v);
            }
            None => self.u32(0),
        }
    }

    fn string(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.bytes.extend_from_slice(s.as_bytes());
    }

    fn ident(&mut self, id: Identifier) {
        // The blob stores the name, not the hash: the loader re-derives
        // hashes so collision detection happens on every load.
        match id.resolve() {
            Some(name) => self.string(&name),
            None => self.string(""),
        }
    }

    fn u32_list(&mut self, list: &[u32]) {
        self.u32(list.len() as u32);
        for &v in list {
            self.u32(v);
        }
    }

    fn string_list(&mut self, list: &[String]) {
        self.u32(list.len() as u32);
        for s in list {
            self.string(s);
        }
    }
}

// ─── Authoring document ───────────────────────────────────────

/// The JSON form integrators write. Compiled to the blob with
/// [`Document::compile`]; never read by the daemon at runtime.
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Document {
    pub machine: MachineDoc,
    pub process_groups: Vec<GroupDoc>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MachineDoc {
    pub main_group: String,
    pub startup_state: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupDoc {
    pub name: String,
    pub off_state: String,
    pub recovery_state: String,
    pub states: Vec<StateDoc>,
    pub processes: Vec<ProcessDoc>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateDoc {
    pub name: String,
    /// Short names of member processes.
    pub processes: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessDoc {
    pub short_name: String,
    pub executable: String,
    #[serde(default)]
    pub argv: Vec<String>,
    #[serde(default)]
    pub envp: Vec<String>,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    #[serde(default)]
    pub supplementary_gids: Vec<u32>,
    #[serde(default)]
    pub affinity_mask: u64,
    #[serde(default = "default_sched_policy")]
    pub sched_policy: SchedPolicy,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default)]
    pub security_policy: Option<String>,
    #[serde(default = "default_comms")]
    pub comms: CommsType,
    #[serde(default)]
    pub self_terminating: bool,
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    #[serde(default = "default_termination_timeout_ms")]
    pub termination_timeout_ms: u64,
    #[serde(default)]
    pub restart_attempts: u32,
    #[serde(default)]
    pub execution_error_code: u64,
    #[serde(default)]
    pub dependencies: Vec<DependencyDoc>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DependencyDoc {
    /// Short name of the predecessor process.
    pub process: String,
    pub state: RequiredState,
}

fn default_sched_policy() -> SchedPolicy {
    SchedPolicy::Other
}

fn default_comms() -> CommsType {
    CommsType::None
}

fn default_startup_timeout_ms() -> u64 {
    5000
}

fn default_termination_timeout_ms() -> u64 {
    2000
}

impl Document {
    pub fn from_json(json: &str) -> Result<Document, CoreError> {
        serde_json::from_str(json)
            .map_err(|e| CoreError::Config(format!("authoring document rejected: {e}")))
    }

    /// Resolve names to indexes, validate, and produce the flat blob.
    pub fn compile(&self) -> Result<Vec<u8>, CoreError> {
        let config = self.resolve()?;
        let blob = config.to_blob();
        // Decode once so the compiler refuses anything the daemon would.
        Config::from_blob(&blob)?;
        Ok(blob)
    }

    fn resolve(&self) -> Result<Config, CoreError> {
        let mut groups = Vec::with_capacity(self.process_groups.len());
        for group in &self.process_groups {
            let by_name: HashMap<&str, u32> = group
                .processes
                .iter()
                .enumerate()
                .map(|(i, p)| (p.short_name.as_str(), i as u32))
                .collect();
            if by_name.len() != group.processes.len() {
                return Err(CoreError::Config(format!(
                    "duplicate process short name in group {}",
                    group.name
                )));
            }
            let lookup = |name: &str| {
                by_name.get(name).copied().ok_or_else(|| {
                    CoreError::Config(format!("unknown process {name:?} in group {}", group.name))
                })
            };

            let qualified = |suffix: &str| format!("{}/{}", group.name, suffix);
            let states = group
                .states
                .iter()
                .map(|state| {
                    Ok(StateConfig {
                        name: Identifier::try_new(&qualified(&state.name))?,
                        processes: state
                            .processes
                            .iter()
                            .map(|n| lookup(n))
                            .collect::<Result<_, _>>()?,
                    })
                })
                .collect::<Result<Vec<_>, CoreError>>()?;

            let processes = group
                .processes
                .iter()
                .map(|p| {
                    Ok(ProcessConfig {
                        short_name: p.short_name.clone(),
                        executable: PathBuf::from(&p.executable),
                        argv: p.argv.clone(),
                        envp: p.envp.clone(),
                        uid: p.uid,
                        gid: p.gid,
                        supplementary_gids: p.supplementary_gids.clone(),
                        affinity_mask: p.affinity_mask,
                        sched_policy: p.sched_policy,
                        priority: p.priority,
                        limits: p.limits,
                        security_policy: p.security_policy.clone(),
                        comms: p.comms,
                        self_terminating: p.self_terminating,
                        startup_timeout: Duration::from_millis(p.startup_timeout_ms),
                        termination_timeout: Duration::from_millis(p.termination_timeout_ms),
                        restart_attempts: p.restart_attempts,
                        execution_error_code: p.execution_error_code,
                        dependencies: p
                            .dependencies
                            .iter()
                            .map(|d| {
                                Ok(Dependency {
                                    process: lookup(&d.process)?,
                                    state: d.state,
                                })
                            })
                            .collect::<Result<_, CoreError>>()?,
                    })
                })
                .collect::<Result<Vec<_>, CoreError>>()?;

            groups.push(GroupConfig {
                name: Identifier::try_new(&group.name)?,
                off_state: Identifier::try_new(&qualified(&group.off_state))?,
                recovery_state: Identifier::try_new(&qualified(&group.recovery_state))?,
                states,
                processes,
            });
        }
        let machine_group = Identifier::try_new(&self.machine.main_group)?;
        let startup_state = Identifier::try_new(&format!(
            "{}/{}",
            self.machine.main_group, self.machine.startup_state
        ))?;
        let config = Config {
            groups,
            machine_group,
            startup_state,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A three-process group with a chain of running dependencies, used
    /// across the crate's tests.
    pub(crate) fn chain_document() -> Document {
        Document::from_json(
            r#"{
                "machine": { "main_group": "MainPG", "startup_state": "Startup" },
                "process_groups": [{
                    "name": "MainPG",
                    "off_state": "Off",
                    "recovery_state": "Recovery",
                    "states": [
                        { "name": "Startup", "processes": ["a", "b", "c"] },
                        { "name": "Recovery", "processes": ["a"] },
                        { "name": "Off", "processes": [] }
                    ],
                    "processes": [
                        { "short_name": "a", "executable": "/bin/a" },
                        { "short_name": "b", "executable": "/bin/b",
                          "dependencies": [ { "process": "a", "state": "running" } ] },
                        { "short_name": "c", "executable": "/bin/c",
                          "dependencies": [ { "process": "b", "state": "running" } ] }
                    ]
                }]
            }"#,
        )
        .unwrap()
    }

    pub(crate) fn chain_config() -> Config {
        Config::from_blob(&chain_document().compile().unwrap()).unwrap()
    }

    #[test]
    fn document_compiles_and_reloads() {
        let config = chain_config();
        assert_eq!(config.groups.len(), 1);
        let group = &config.groups[0];
        assert_eq!(group.processes.len(), 3);
        assert_eq!(group.processes[1].dependencies.len(), 1);
        assert_eq!(group.processes[1].dependencies[0].process, 0);
        assert_eq!(
            config
                .process_indexes(config.machine_group, config.startup_state)
                .unwrap()
                .to_vec(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn unknown_field_rejected() {
        let err = Document::from_json(
            r#"{ "machine": { "main_group": "M", "startup_state": "S", "bogus": 1 },
                 "process_groups": [] }"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn bad_magic_rejected() {
        let mut blob = chain_document().compile().unwrap();
        blob[0] ^= 0xFF;
        assert!(Config::from_blob(&blob).is_err());
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut blob = chain_document().compile().unwrap();
        blob.push(0);
        assert!(Config::from_blob(&blob).is_err());
    }

    #[test]
    fn truncated_blob_rejected() {
        let blob = chain_document().compile().unwrap();
        assert!(Config::from_blob(&blob[..blob.len() - 3]).is_err());
    }

    #[test]
    fn cyclic_dependencies_rejected() {
        let doc = Document::from_json(
            r#"{
                "machine": { "main_group": "CycPG", "startup_state": "On" },
                "process_groups": [{
                    "name": "CycPG",
                    "off_state": "Off",
                    "recovery_state": "Off",
                    "states": [ { "name": "On", "processes": ["x", "y"] },
                                { "name": "Off", "processes": [] } ],
                    "processes": [
                        { "short_name": "x", "executable": "/bin/x",
                          "dependencies": [ { "process": "y", "state": "running" } ] },
                        { "short_name": "y", "executable": "/bin/y",
                          "dependencies": [ { "process": "x", "state": "running" } ] }
                    ]
                }]
            }"#,
        )
        .unwrap();
        assert!(doc.compile().is_err());
    }

    #[test]
    fn unknown_dependency_name_rejected() {
        let doc = Document::from_json(
            r#"{
                "machine": { "main_group": "DepPG", "startup_state": "On" },
                "process_groups": [{
                    "name": "DepPG",
                    "off_state": "Off",
                    "recovery_state": "Off",
                    "states": [ { "name": "On", "processes": ["p"] },
                                { "name": "Off", "processes": [] } ],
                    "processes": [
                        { "short_name": "p", "executable": "/bin/p",
                          "dependencies": [ { "process": "ghost", "state": "running" } ] }
                    ]
                }]
            }"#,
        )
        .unwrap();
        assert!(doc.compile().is_err());
    }

    #[test]
    fn blob_survives_tempfile_round_trip() {
        let blob = chain_document().compile().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("topology.bin");
        std::fs::write(&path, &blob).unwrap();
        let config = Config::load_path(&path).unwrap();
        assert_eq!(config.total_processes(), 3);
    }
}
