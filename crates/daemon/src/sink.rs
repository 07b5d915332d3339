//! Audio sink child process
//!
//! The daemon never talks to a platform audio API directly; it spawns a
//! configured player command and feeds it raw PCM on stdin. The command's
//! argument template takes `{rate}`, `{bits}` and `{channels}` from the
//! negotiated stream format.

use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};

use lyra_config::DaemonSettings;
use lyra_core::AudioFormat;

use crate::DaemonError;

#[derive(Debug)]
pub struct AudioSink {
    child: Child,
    stdin: Option<ChildStdin>,
}

impl AudioSink {
    /// Spawn the sink process for `format`
    pub fn spawn(settings: &DaemonSettings, format: AudioFormat) -> Result<Self, DaemonError> {
        let args: Vec<String> = settings
            .sink_args
            .iter()
            .map(|a| {
                a.replace("{rate}", &format.sample_rate.as_u32().to_string())
                    .replace("{bits}", &format.bit_depth.bits().to_string())
                    .replace("{channels}", &format.channels.count().to_string())
            })
            .collect();

        tracing::info!(command = %settings.sink_command, ?args, "Spawning audio sink");

        let mut child = Command::new(&settings.sink_command)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DaemonError::SinkSpawn(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DaemonError::SinkSpawn("no stdin handle".to_string()))?;

        Ok(Self {
            child,
            stdin: Some(stdin),
        })
    }

    /// Write one unit of PCM; an error here usually means the child died
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), DaemonError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| DaemonError::SinkDied("stdin already closed".to_string()))?;
        stdin
            .write_all(bytes)
            .await
            .map_err(|e| DaemonError::SinkDied(e.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|e| DaemonError::SinkDied(e.to_string()))
    }

    /// Close stdin so the child drains its internal buffer and exits
    pub async fn finish(mut self) -> Result<(), DaemonError> {
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.shutdown().await;
        }
        match self.child.wait().await {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(DaemonError::SinkDied(format!(
                "sink exited with {status}"
            ))),
            Err(e) => Err(DaemonError::SinkDied(e.to_string())),
        }
    }

    /// Hard stop; used by the `stop` action, never by `end_stream`
    pub async fn kill(mut self) {
        self.stdin.take();
        if let Err(e) = self.child.kill().await {
            tracing::debug!(error = %e, "Sink kill failed (may have exited)");
        }
    }

    /// Has the child exited on its own?
    pub fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cat_settings() -> DaemonSettings {
        // `cat` stands in for a player: consumes stdin until EOF
        DaemonSettings {
            sink_command: "cat".to_string(),
            sink_args: vec![],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_spawn_write_finish() {
        let mut sink = AudioSink::spawn(&cat_settings(), AudioFormat::default()).unwrap();
        sink.write(&[0u8; 1024]).await.unwrap();
        sink.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_after_child_death_errors() {
        let mut sink = AudioSink::spawn(&cat_settings(), AudioFormat::default()).unwrap();
        sink.child.kill().await.unwrap();
        sink.child.wait().await.unwrap();

        // The pipe is broken now; a write must surface SinkDied
        let mut failed = false;
        for _ in 0..4 {
            if sink.write(&[0u8; 65536]).await.is_err() {
                failed = true;
                break;
            }
        }
        assert!(failed);
    }

    #[tokio::test]
    async fn test_kill_is_quiet() {
        let sink = AudioSink::spawn(&cat_settings(), AudioFormat::default()).unwrap();
        sink.kill().await;
    }

    #[tokio::test]
    async fn test_missing_command_is_spawn_error() {
        let settings = DaemonSettings {
            sink_command: "definitely-not-a-real-player".to_string(),
            sink_args: vec![],
            ..Default::default()
        };
        let err = AudioSink::spawn(&settings, AudioFormat::default()).unwrap_err();
        assert!(matches!(err, DaemonError::SinkSpawn(_)));
    }

    #[test]
    fn test_arg_template_substitution() {
        let settings = DaemonSettings::default();
        let format = AudioFormat::default();
        let args: Vec<String> = settings
            .sink_args
            .iter()
            .map(|a| {
                a.replace("{rate}", &format.sample_rate.as_u32().to_string())
                    .replace("{bits}", &format.bit_depth.bits().to_string())
                    .replace("{channels}", &format.channels.count().to_string())
            })
            .collect();
        assert!(args.contains(&"24000".to_string()));
        assert!(args.contains(&"16".to_string()));
        assert!(args.contains(&"1".to_string()));
    }
}
