//! Chained Directory Transfer
//!
//! Copies a directory tree from one host to N destinations with exactly one
//! read of the source data: the stream is sent to the first destination,
//! which tees it to local disk and onward to the next hop through a named
//! pipe, and so on down the chain. The whole chain fails atomically; a
//! broken link is never retried. A verification pass compares file names
//! and sizes between source and every destination afterwards.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::infrastructure::tasks::fan_out_join;
use crate::topology::host::Host;
use std::sync::Arc;
use std::time::Duration;

/// Options for one transfer.
#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// Copy into non-empty destinations instead of refusing.
    pub overwrite: bool,
    /// Specific entries under the source directory; empty means everything.
    pub files: Vec<String>,
    /// Base TCP port for the chain; hop i listens on `port_base + i`.
    pub port_base: u16,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            overwrite: false,
            files: Vec::new(),
            port_base: 0, // 0 = take the configured transfer port
        }
    }
}

/// One receiving hop of the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Stage {
    pub ip: String,
    pub port: u16,
    pub command: String,
}

/// Fully rendered command plan for a transfer.
#[derive(Debug, Clone)]
pub(crate) struct TransferPlan {
    /// Receiving stages in chain order (first hop first).
    pub stages: Vec<Stage>,
    pub sender_command: String,
}

fn file_list(files: &[String]) -> String {
    if files.is_empty() {
        ".".to_string()
    } else {
        files.join(" ")
    }
}

/// Local decode pipeline: optional decrypt, optional decompress, untar.
fn decode_pipeline(config: &Config, dir: &str) -> String {
    let mut parts = Vec::new();
    if let Some(decrypt) = &config.decrypt_command {
        parts.push(decrypt.clone());
    }
    if let Some(decompress) = &config.decompress_command {
        parts.push(decompress.clone());
    }
    parts.push(format!("tar x -C {}", dir));
    parts.join(" | ")
}

/// Render the full command plan. Pure string assembly, separated from
/// execution so it can be inspected and tested without hosts.
pub(crate) fn build_plan(
    config: &Config,
    source_dir: &str,
    destinations: &[(String, String)],
    options: &TransferOptions,
) -> Result<TransferPlan> {
    let port_base = if options.port_base == 0 {
        config.transfer_port
    } else {
        options.port_base
    };
    let port_for = |i: usize| -> Result<u16> {
        u16::try_from(i)
            .ok()
            .and_then(|offset| port_base.checked_add(offset))
            .ok_or_else(|| {
                Error::Precondition(format!(
                    "transfer port range starting at {} overflows for {} destination(s)",
                    port_base,
                    destinations.len()
                ))
            })
    };

    let mut stages = Vec::with_capacity(destinations.len());
    for (i, (ip, dir)) in destinations.iter().enumerate() {
        let port = port_for(i)?;
        let decode = decode_pipeline(config, dir);
        let command = match destinations.get(i + 1) {
            // Intermediate hop: tee the raw stream onward while decoding a
            // copy locally. The forward nc is backgrounded against the fifo
            // so tee never blocks on a slow next hop handshake.
            Some((next_ip, _)) => {
                let next_port = port_for(i + 1)?;
                let fifo = format!("/tmp/shardherd_fifo_{}", port);
                format!(
                    "rm -f {fifo} && mkfifo {fifo} && (nc {next_ip} {next_port} < {fifo} &) && nc -l {port} | tee {fifo} | {decode}; rm -f {fifo}",
                    fifo = fifo,
                    next_ip = next_ip,
                    next_port = next_port,
                    port = port,
                    decode = decode,
                )
            }
            // Tail of the chain decodes straight into the target directory.
            None => format!("nc -l {} | {}", port, decode),
        };
        stages.push(Stage {
            ip: ip.clone(),
            port,
            command,
        });
    }

    let mut sender_parts = vec![format!(
        "tar c -C {} {}",
        source_dir,
        file_list(&options.files)
    )];
    if let Some(compress) = &config.compress_command {
        sender_parts.push(compress.clone());
    }
    if let Some(encrypt) = &config.encrypt_command {
        sender_parts.push(encrypt.clone());
    }
    if let Some(first) = stages.first() {
        sender_parts.push(format!("nc {} {}", first.ip, first.port));
    }

    Ok(TransferPlan {
        stages,
        sender_command: sender_parts.join(" | "),
    })
}

/// Reject destination paths that would clobber unrelated data.
fn validate_destination(path: &str) -> Result<()> {
    let trimmed = path.trim_end_matches('/');
    if path.is_empty() || trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        return Err(Error::Precondition(format!(
            "invalid transfer destination {:?}",
            path
        )));
    }
    Ok(())
}

/// Relevant subset of a listing given the requested file set.
fn relevant<'a>(
    listing: &'a std::collections::BTreeMap<String, u64>,
    files: &[String],
) -> Vec<(&'a String, &'a u64)> {
    listing
        .iter()
        .filter(|(name, _)| {
            files.is_empty()
                || files
                    .iter()
                    .any(|f| *name == f || name.starts_with(&format!("{}/", f)))
        })
        .collect()
}

/// Run the chained transfer protocol against live hosts.
///
/// Listeners are brought up tail-first and each is confirmed bound before
/// the upstream stage starts; the source then streams once into the head of
/// the chain. Any stage failure aborts the whole operation.
pub async fn transfer_directory(
    source: &Arc<Host>,
    source_dir: &str,
    destinations: &[(Arc<Host>, String)],
    options: &TransferOptions,
) -> Result<()> {
    if destinations.is_empty() {
        return Err(Error::Precondition("no transfer destinations".to_string()));
    }
    let config = source.config().clone();

    for (_, dir) in destinations {
        validate_destination(dir)?;
    }

    // Destinations must be empty for the requested file set unless the
    // caller explicitly asked to overwrite.
    for (host, dir) in destinations {
        host.execute(&format!("mkdir -p {}", dir), config.command_retries)
            .await?;
        if !options.overwrite {
            let listing = host.directory_listing(dir).await?;
            if let Some((name, _)) = relevant(&listing, &options.files)
                .into_iter()
                .find(|(_, size)| **size > 0)
            {
                return Err(Error::NonEmptyDestination {
                    ip: host.ip().to_string(),
                    path: format!("{}/{}", dir.trim_end_matches('/'), name),
                });
            }
        }
    }

    let dest_spec: Vec<(String, String)> = destinations
        .iter()
        .map(|(host, dir)| (host.ip().to_string(), dir.clone()))
        .collect();
    let plan = build_plan(&config, source_dir, &dest_spec, options)?;

    let total_bytes = source.directory_size(source_dir).await.unwrap_or(0);
    tracing::info!(
        "transferring {} ({} bytes) from {} to {} destination(s)",
        source_dir,
        total_bytes,
        source.ip(),
        destinations.len()
    );

    // Bring up receivers from the tail of the chain so every forward target
    // is already listening when its upstream hop starts.
    let listener_timeout = Duration::from_secs(config.listener_timeout_secs);
    let mut handles = Vec::with_capacity(plan.stages.len());
    for (stage, (host, _)) in plan.stages.iter().zip(destinations.iter()).rev() {
        let host = host.clone();
        let command = stage.command.clone();
        let handle = tokio::spawn(async move { host.execute(&command, 0).await });
        host_wait(&destinations, &stage.ip, stage.port, listener_timeout).await?;
        handles.push((stage.ip.clone(), handle));
    }

    // One read of the source serves the whole chain.
    if let Err(err) = source.execute(&plan.sender_command, 0).await {
        for (_, handle) in &handles {
            handle.abort();
        }
        return Err(err);
    }

    // Join every chain stage; a failure anywhere fails the operation.
    let mut failures = Vec::new();
    let total = handles.len();
    for (ip, handle) in handles {
        match handle.await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => failures.push(format!("{}: {}", ip, err)),
            Err(err) => failures.push(format!("{}: receiver task failed: {}", ip, err)),
        }
    }
    if !failures.is_empty() {
        return Err(Error::Aggregate { total, failures });
    }

    verify_transfer(source, source_dir, destinations, &options.files).await?;
    tracing::info!("transfer of {} complete and verified", source_dir);
    Ok(())
}

async fn host_wait(
    destinations: &[(Arc<Host>, String)],
    ip: &str,
    port: u16,
    timeout: Duration,
) -> Result<()> {
    for (host, _) in destinations {
        if host.ip() == ip {
            return host.wait_for_listener(port, timeout).await;
        }
    }
    Err(Error::Precondition(format!("unknown chain host {}", ip)))
}

/// Recursively compare file name and size between source and every
/// destination; any mismatch raises with the offending path.
async fn verify_transfer(
    source: &Arc<Host>,
    source_dir: &str,
    destinations: &[(Arc<Host>, String)],
    files: &[String],
) -> Result<()> {
    let source_listing = source.directory_listing(source_dir).await?;
    let expected: Vec<(String, u64)> = relevant(&source_listing, files)
        .into_iter()
        .map(|(name, size)| (name.clone(), *size))
        .collect();

    let checks = destinations
        .iter()
        .map(|(host, dir)| {
            let host = host.clone();
            let dir = dir.clone();
            let expected = expected.clone();
            (
                host.ip().to_string(),
                async move {
                    let listing = host.directory_listing(&dir).await?;
                    for (name, size) in &expected {
                        match listing.get(name) {
                            Some(found) if found == size => {}
                            Some(found) => {
                                return Err(Error::TransferVerification {
                                    path: format!("{}:{}/{}", host.ip(), dir, name),
                                    detail: format!("size {} != source size {}", found, size),
                                })
                            }
                            None => {
                                return Err(Error::TransferVerification {
                                    path: format!("{}:{}/{}", host.ip(), dir, name),
                                    detail: "missing on destination".to_string(),
                                })
                            }
                        }
                    }
                    Ok(())
                },
            )
        })
        .collect();

    fan_out_join(checks).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dests(n: usize) -> Vec<(String, String)> {
        (0..n)
            .map(|i| (format!("10.0.0.{}", i + 1), "/var/lib/mysql".to_string()))
            .collect()
    }

    #[test]
    fn test_plan_single_destination() {
        let config = Config::default();
        let plan =
            build_plan(&config, "/var/lib/mysql", &dests(1), &TransferOptions::default()).unwrap();

        assert_eq!(plan.stages.len(), 1);
        let stage = &plan.stages[0];
        assert_eq!(stage.port, 7000);
        assert!(stage.command.starts_with("nc -l 7000"));
        assert!(stage.command.contains("tar x -C /var/lib/mysql"));
        assert!(!stage.command.contains("tee"));
        assert_eq!(
            plan.sender_command,
            "tar c -C /var/lib/mysql . | nc 10.0.0.1 7000"
        );
    }

    #[test]
    fn test_plan_chain_tees_at_intermediates() {
        let config = Config::default();
        let plan =
            build_plan(&config, "/var/lib/mysql", &dests(3), &TransferOptions::default()).unwrap();

        assert_eq!(plan.stages.len(), 3);
        // First two hops tee onward, the tail only decodes.
        assert!(plan.stages[0].command.contains("tee"));
        assert!(plan.stages[0].command.contains("nc 10.0.0.2 7001"));
        assert!(plan.stages[1].command.contains("tee"));
        assert!(plan.stages[1].command.contains("nc 10.0.0.3 7002"));
        assert!(!plan.stages[2].command.contains("tee"));
        // Every hop decodes into its own directory.
        for stage in &plan.stages {
            assert!(stage.command.contains("tar x -C /var/lib/mysql"));
        }
        assert!(plan.sender_command.ends_with("nc 10.0.0.1 7000"));
    }

    #[test]
    fn test_plan_with_compression_and_encryption() {
        let config = Config {
            compress_command: Some("pigz".to_string()),
            decompress_command: Some("pigz -d".to_string()),
            encrypt_command: Some("openssl enc -aes-128-cbc".to_string()),
            decrypt_command: Some("openssl enc -d -aes-128-cbc".to_string()),
            ..Default::default()
        };
        let plan = build_plan(&config, "/data", &dests(2), &TransferOptions::default()).unwrap();

        assert_eq!(
            plan.sender_command,
            "tar c -C /data . | pigz | openssl enc -aes-128-cbc | nc 10.0.0.1 7000"
        );
        // Receivers mirror the pipeline in reverse order.
        assert!(plan.stages[1]
            .command
            .contains("openssl enc -d -aes-128-cbc | pigz -d | tar x"));
        // The intermediate hop forwards the still-encoded stream.
        let tee_pos = plan.stages[0].command.find("tee").unwrap();
        let decrypt_pos = plan.stages[0].command.find("openssl enc -d").unwrap();
        assert!(tee_pos < decrypt_pos);
    }

    #[test]
    fn test_plan_specific_files() {
        let config = Config::default();
        let options = TransferOptions {
            files: vec!["db".to_string(), "ibdata1".to_string()],
            ..Default::default()
        };
        let plan = build_plan(&config, "/var/lib/mysql", &dests(1), &options).unwrap();
        assert!(plan.sender_command.starts_with("tar c -C /var/lib/mysql db ibdata1"));
    }

    #[test]
    fn test_plan_rejects_port_range_overflow() {
        let config = Config::default();
        let options = TransferOptions {
            port_base: u16::MAX,
            ..Default::default()
        };
        // The last port still fits with one destination.
        assert!(build_plan(&config, "/data", &dests(1), &options).is_ok());
        let err = build_plan(&config, "/data", &dests(2), &options).unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[test]
    fn test_validate_destination() {
        assert!(validate_destination("/var/lib/mysql").is_ok());
        assert!(validate_destination("").is_err());
        assert!(validate_destination(".").is_err());
        assert!(validate_destination("..").is_err());
        assert!(validate_destination("/").is_err());
        assert!(validate_destination("//").is_err());
    }

    #[test]
    fn test_relevant_filters_by_file_set() {
        let mut listing = std::collections::BTreeMap::new();
        listing.insert("db/t1.ibd".to_string(), 100u64);
        listing.insert("other/t2.ibd".to_string(), 50);
        listing.insert("ibdata1".to_string(), 10);

        let subset = relevant(&listing, &["db".to_string()]);
        assert_eq!(subset.len(), 1);
        assert_eq!(subset[0].0, "db/t1.ibd");

        let all = relevant(&listing, &[]);
        assert_eq!(all.len(), 3);
    }
}
