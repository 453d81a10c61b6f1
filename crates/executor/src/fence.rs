//! The fence itself.

use hotpocket_types::{hash_outputs, ExecutionResult, KeyPair, PublicKey, UserInput, UserOutput};
use hotpocket_vfs::{VfsClient, PATCH_FILE_PATH, RW_SESSION_NAME, STATE_DIR_PATH};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Resource caps enforced on the contract process.
#[derive(Debug, Clone, Copy)]
pub struct ExecLimits {
    /// CPU seconds before the kernel kills the process (0 = unlimited).
    pub proc_cpu_seconds: u64,
    /// Address-space cap in bytes (0 = unlimited).
    pub proc_mem_bytes: u64,
    /// Open-fd cap (0 = unlimited).
    pub proc_ofd_count: u64,
    /// Wall-clock budget; overruns are killed.
    pub exec_timeout: Duration,
}

impl Default for ExecLimits {
    fn default() -> Self {
        Self {
            proc_cpu_seconds: 0,
            proc_mem_bytes: 0,
            proc_ofd_count: 0,
            exec_timeout: Duration::from_secs(30),
        }
    }
}

/// How to invoke the contract binary.
#[derive(Debug, Clone)]
pub struct ContractConfig {
    /// Binary path.
    pub bin_path: PathBuf,
    /// Arguments appended after the built-in ones.
    pub bin_args: Vec<String>,
    /// Extra environment.
    pub environment: Vec<(String, String)>,
    /// Run as this uid:gid instead of the node's own identity.
    pub run_as: Option<(u32, u32)>,
    /// Resource caps.
    pub limits: ExecLimits,
}

/// What a round feeds into the fence.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Sequence number the round will commit as.
    pub seq_no: u64,
    /// Consensus time, ms.
    pub time: u64,
    /// Admitted users.
    pub users: Vec<PublicKey>,
    /// Admitted inputs, resolved to blobs.
    pub inputs: Vec<UserInput>,
    /// NPL payloads visible this round.
    pub npl_messages: Vec<(PublicKey, Vec<u8>)>,
}

/// Fence failures. Any of these leaves the round without execution
/// results; none of them crashes the node.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("vfs error: {0}")]
    Vfs(#[from] hotpocket_vfs::VfsError),
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("contract exceeded the {0:?} execution budget")]
    Timeout(Duration),
    #[error("contract exited with status {0}")]
    NonZeroExit(i32),
    #[error("contract killed by signal")]
    Killed,
}

impl ExecError {
    fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        ExecError::Io {
            path: path.into(),
            source,
        }
    }
}

/// The execution fence. One per contract mount; rounds may not overlap
/// because the RW session is exclusive to one round by design.
pub struct ExecutionFence {
    vfs: VfsClient,
    key: KeyPair,
    config: ContractConfig,
    /// Scratch directory for input/output trees, wiped per round.
    exec_dir: PathBuf,
}

impl ExecutionFence {
    /// Create a fence using `exec_dir` as scratch space.
    pub fn new(vfs: VfsClient, key: KeyPair, config: ContractConfig, exec_dir: PathBuf) -> Self {
        Self {
            vfs,
            key,
            config,
            exec_dir,
        }
    }

    /// Execute one round.
    ///
    /// On success the RW session remains held (one refcount) for the
    /// engine to promote; on failure the session is released.
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, ExecError> {
        self.vfs.acquire_rw().await?;

        match self.execute_inner(&request).await {
            Ok(result) => Ok(result),
            Err(e) => {
                // Never promote after a failed run.
                warn!(seq_no = request.seq_no, error = %e, "Execution failed, releasing RW session");
                if let Err(release_err) = self.vfs.release_rw().await {
                    warn!(error = %release_err, "RW release after failure also failed");
                }
                Err(e)
            }
        }
    }

    async fn execute_inner(&self, request: &ExecutionRequest) -> Result<ExecutionResult, ExecError> {
        let round_dir = self.exec_dir.join(request.seq_no.to_string());
        let input_dir = round_dir.join("input");
        let output_dir = round_dir.join("output");
        let npl_dir = round_dir.join("npl");
        self.materialize_inputs(request, &input_dir, &output_dir, &npl_dir)?;

        let state_root = self
            .vfs
            .physical_path(RW_SESSION_NAME, STATE_DIR_PATH)
            .await?;

        let mut command = Command::new(&self.config.bin_path);
        command
            .args(&self.config.bin_args)
            .current_dir(&state_root)
            .env("HP_SEQ_NO", request.seq_no.to_string())
            .env("HP_TIME", request.time.to_string())
            .env("HP_INPUT_DIR", &input_dir)
            .env("HP_OUTPUT_DIR", &output_dir)
            .env("HP_NPL_DIR", &npl_dir)
            .envs(self.config.environment.iter().cloned())
            .kill_on_drop(true);

        if let Some((uid, gid)) = self.config.run_as {
            command.uid(uid).gid(gid);
        }
        apply_rlimits(&mut command, self.config.limits);

        debug!(
            seq_no = request.seq_no,
            bin = %self.config.bin_path.display(),
            inputs = request.inputs.len(),
            "Spawning contract"
        );

        let mut child = command
            .spawn()
            .map_err(|e| ExecError::io(self.config.bin_path.display().to_string(), e))?;

        let status = match tokio::time::timeout(self.config.limits.exec_timeout, child.wait()).await
        {
            Ok(status) => status.map_err(|e| ExecError::io("wait".to_string(), e))?,
            Err(_) => {
                let _ = child.kill().await;
                return Err(ExecError::Timeout(self.config.limits.exec_timeout));
            }
        };

        if !status.success() {
            return match status.code() {
                Some(code) => Err(ExecError::NonZeroExit(code)),
                None => Err(ExecError::Killed),
            };
        }

        let outputs = collect_outputs(&output_dir)?;
        let npl_output = read_npl_output(&npl_dir)?;
        let output_hash = hash_outputs(&outputs);
        let output_sig = self.key.sign(output_hash.as_bytes());

        let state_hash = self.vfs.get_hash(RW_SESSION_NAME, STATE_DIR_PATH).await?;
        let patch_hash = self.vfs.get_hash(RW_SESSION_NAME, PATCH_FILE_PATH).await?;

        // Scratch space is per round; stale trees would leak replays.
        let _ = std::fs::remove_dir_all(&round_dir);

        info!(
            seq_no = request.seq_no,
            outputs = outputs.len(),
            state_hash = ?state_hash,
            "Contract executed"
        );

        Ok(ExecutionResult {
            state_hash,
            patch_hash,
            output_hash,
            output_sig,
            outputs,
            npl_output,
        })
    }

    fn materialize_inputs(
        &self,
        request: &ExecutionRequest,
        input_dir: &Path,
        output_dir: &Path,
        npl_dir: &Path,
    ) -> Result<(), ExecError> {
        for dir in [input_dir, output_dir, npl_dir] {
            if dir.exists() {
                std::fs::remove_dir_all(dir)
                    .map_err(|e| ExecError::io(dir.display().to_string(), e))?;
            }
            std::fs::create_dir_all(dir)
                .map_err(|e| ExecError::io(dir.display().to_string(), e))?;
        }

        // One directory per admitted user, inputs ordered by digest so
        // every node materializes the identical tree.
        let mut ordered = request.inputs.clone();
        ordered.sort_by_key(|i| i.digest());
        let mut per_user_index: std::collections::HashMap<PublicKey, u32> =
            std::collections::HashMap::new();
        for input in &ordered {
            let user_dir = input_dir.join(input.pubkey.to_hex());
            std::fs::create_dir_all(&user_dir)
                .map_err(|e| ExecError::io(user_dir.display().to_string(), e))?;
            let index = per_user_index.entry(input.pubkey).or_default();
            let path = user_dir.join(format!("{index}.in"));
            std::fs::write(&path, &input.input_container)
                .map_err(|e| ExecError::io(path.display().to_string(), e))?;
            *index += 1;
        }

        // Users with no input this round still get their directory; the
        // contract may address them.
        for user in &request.users {
            let user_dir = input_dir.join(user.to_hex());
            std::fs::create_dir_all(&user_dir)
                .map_err(|e| ExecError::io(user_dir.display().to_string(), e))?;
        }

        for (index, (pubkey, data)) in request.npl_messages.iter().enumerate() {
            let path = npl_dir.join(format!("{index}_{}.msg", pubkey.to_hex()));
            std::fs::write(&path, data).map_err(|e| ExecError::io(path.display().to_string(), e))?;
        }

        Ok(())
    }
}

/// Install kernel resource limits in the child, between fork and exec.
fn apply_rlimits(command: &mut Command, limits: ExecLimits) {
    unsafe {
        command.pre_exec(move || {
            if limits.proc_cpu_seconds > 0 {
                set_rlimit(libc::RLIMIT_CPU, limits.proc_cpu_seconds)?;
            }
            if limits.proc_mem_bytes > 0 {
                set_rlimit(libc::RLIMIT_AS, limits.proc_mem_bytes)?;
            }
            if limits.proc_ofd_count > 0 {
                set_rlimit(libc::RLIMIT_NOFILE, limits.proc_ofd_count)?;
            }
            Ok(())
        });
    }
}

fn set_rlimit(resource: libc::__rlimit_resource_t, value: u64) -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: value,
        rlim_max: value,
    };
    // Safety: plain syscall on a stack value.
    let rc = unsafe { libc::setrlimit(resource, &limit) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Gather `output/<user-hex>/*` files into per-user output sets,
/// buffers ordered by file name.
fn collect_outputs(output_dir: &Path) -> Result<Vec<UserOutput>, ExecError> {
    let mut outputs = Vec::new();
    let entries = match std::fs::read_dir(output_dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(outputs),
    };

    for entry in entries {
        let entry = entry.map_err(|e| ExecError::io(output_dir.display().to_string(), e))?;
        let user_dir = entry.path();
        if !user_dir.is_dir() {
            continue;
        }
        let Some(pubkey) = entry
            .file_name()
            .to_str()
            .and_then(|s| PublicKey::from_hex(s).ok())
        else {
            warn!(dir = %user_dir.display(), "Output directory is not a user key, skipping");
            continue;
        };

        let mut names: Vec<PathBuf> = std::fs::read_dir(&user_dir)
            .map_err(|e| ExecError::io(user_dir.display().to_string(), e))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        names.sort();

        let mut buffers = Vec::with_capacity(names.len());
        for path in names {
            buffers.push(
                std::fs::read(&path).map_err(|e| ExecError::io(path.display().to_string(), e))?,
            );
        }
        outputs.push(UserOutput { pubkey, buffers });
    }

    outputs.sort_by(|a, b| a.pubkey.cmp(&b.pubkey));
    Ok(outputs)
}

fn read_npl_output(npl_dir: &Path) -> Result<Option<Vec<u8>>, ExecError> {
    let path = npl_dir.join("npl.out");
    if !path.exists() {
        return Ok(None);
    }
    Ok(Some(std::fs::read(&path).map_err(|e| {
        ExecError::io(path.display().to_string(), e)
    })?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotpocket_types::test_utils::test_keypair;
    use hotpocket_types::{Hash, Protocol};
    use hotpocket_vfs::DirFs;
    use std::sync::Arc;

    fn fence_with(script: &str, limits: ExecLimits) -> (tempfile::TempDir, ExecutionFence) {
        let dir = tempfile::tempdir().unwrap();
        let mount = Arc::new(DirFs::open(0, dir.path().join("fs")).unwrap());
        let vfs = VfsClient::spawn(mount);

        let bin = dir.path().join("contract.sh");
        std::fs::write(&bin, format!("#!/bin/sh\n{script}\n")).unwrap();
        let mut perms = std::fs::metadata(&bin).unwrap().permissions();
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(0o755);
        std::fs::set_permissions(&bin, perms).unwrap();

        let fence = ExecutionFence::new(
            vfs,
            test_keypair(1),
            ContractConfig {
                bin_path: bin,
                bin_args: vec![],
                environment: vec![("HP_TEST".into(), "1".into())],
                run_as: None,
                limits,
            },
            dir.path().join("exec"),
        );
        (dir, fence)
    }

    fn request(inputs: Vec<UserInput>) -> ExecutionRequest {
        ExecutionRequest {
            seq_no: 1,
            time: 1_700_000_000_000,
            users: inputs.iter().map(|i| i.pubkey).collect(),
            inputs,
            npl_messages: vec![],
        }
    }

    fn signed_input(seed: u8, payload: &[u8]) -> UserInput {
        let kp = test_keypair(seed);
        UserInput {
            pubkey: kp.public_key(),
            input_container: payload.to_vec(),
            sig: kp.sign(payload),
            protocol: Protocol::Json,
            nonce: 1,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn clean_run_produces_result() {
        // The contract writes a state file and echoes each input back
        // as an output.
        let script = r#"
echo updated > state.txt
for user in "$HP_INPUT_DIR"/*/; do
  name=$(basename "$user")
  mkdir -p "$HP_OUTPUT_DIR/$name"
  i=0
  for f in "$user"*.in; do
    [ -e "$f" ] || continue
    cp "$f" "$HP_OUTPUT_DIR/$name/$i.out"
    i=$((i+1))
  done
done
"#;
        let (_dir, fence) = fence_with(script, ExecLimits::default());
        let input = signed_input(2, b"ping");
        let result = fence.execute(request(vec![input.clone()])).await.unwrap();

        assert_ne!(result.state_hash, Hash::ZERO);
        assert_eq!(result.outputs.len(), 1);
        assert_eq!(result.outputs[0].pubkey, input.pubkey);
        assert_eq!(result.outputs[0].buffers, vec![b"ping".to_vec()]);
        assert_eq!(result.output_hash, hash_outputs(&result.outputs));
        // The node signed the output hash.
        assert!(fence
            .key
            .public_key()
            .verify(result.output_hash.as_bytes(), &result.output_sig)
            .is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn timeout_kills_and_fails() {
        let (_dir, fence) = fence_with(
            "sleep 30",
            ExecLimits {
                exec_timeout: Duration::from_millis(200),
                ..Default::default()
            },
        );
        let err = fence.execute(request(vec![])).await.unwrap_err();
        assert!(matches!(err, ExecError::Timeout(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn nonzero_exit_fails() {
        let (_dir, fence) = fence_with("exit 3", ExecLimits::default());
        let err = fence.execute(request(vec![])).await.unwrap_err();
        assert!(matches!(err, ExecError::NonZeroExit(3)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_round_hashes_outputs_to_zero() {
        let (_dir, fence) = fence_with("true", ExecLimits::default());
        let result = fence.execute(request(vec![])).await.unwrap();
        assert_eq!(result.output_hash, Hash::ZERO);
        assert!(result.npl_output.is_none());
    }
}
