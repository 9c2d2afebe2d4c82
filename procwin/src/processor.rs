//! Reads `[key] value` lines from stdin, windows them by the time they are read and writes every
//! fired window as one JSON line to stdout.

use std::collections::HashMap;
use std::error::Error;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::{LinesStream, ReceiverStream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use procwin_core::metrics::start_metrics_server;
use procwin_core::{
    Count, Mean, MonotonicClock, Settings, Sum, WindowFunction, WindowResult, WindowRuntime,
};

const ENV_FUNCTION: &str = "PROCWIN_FUNCTION";

/// Built-in window functions selectable from the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum FunctionKind {
    #[default]
    Sum,
    Count,
    Mean,
}

impl FromStr for FunctionKind {
    type Err = procwin_core::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sum" => Ok(FunctionKind::Sum),
            "count" => Ok(FunctionKind::Count),
            "mean" => Ok(FunctionKind::Mean),
            other => Err(procwin_core::Error::Config(format!(
                "invalid {ENV_FUNCTION}: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ProcessorSettings {
    pub(crate) core: Settings,
    pub(crate) function: FunctionKind,
    pub(crate) serve_metrics: bool,
}

impl TryFrom<HashMap<String, String>> for ProcessorSettings {
    type Error = procwin_core::Error;

    fn try_from(env_vars: HashMap<String, String>) -> Result<Self, Self::Error> {
        let function = env_vars
            .get(ENV_FUNCTION)
            .map(|f| f.parse())
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            core: Settings::try_from(env_vars)?,
            function,
            serve_metrics: true,
        })
    }
}

/// A parsed input line.
#[derive(Debug, PartialEq)]
struct InputLine {
    key: Option<String>,
    value: i64,
}

/// Parses `key value` or, when the stream is not keyed, also a bare `value`. Blank lines are
/// skipped.
fn parse_line(line: &str, keyed: bool) -> Result<Option<InputLine>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let (key, value) = match line.rsplit_once(char::is_whitespace) {
        Some((key, value)) => (Some(key.trim().to_string()), value),
        None if keyed => return Err(format!("expected `<key> <value>`, got `{line}`")),
        None => (None, line),
    };

    let value = value
        .parse::<i64>()
        .map_err(|e| format!("invalid value `{value}`: {e}"))?;
    Ok(Some(InputLine { key, value }))
}

pub(crate) async fn run(
    settings: ProcessorSettings,
    cln_token: CancellationToken,
) -> Result<(), Box<dyn Error>> {
    let metrics_handle = if settings.serve_metrics {
        let addr = SocketAddr::from(([0, 0, 0, 0], settings.core.metrics_port));
        Some(tokio::spawn(async move {
            if let Err(e) = start_metrics_server(addr).await {
                error!(?e, "Metrics server failed");
            }
        }))
    } else {
        None
    };

    let result = match settings.function {
        FunctionKind::Sum => process(&settings.core, Sum, cln_token).await,
        FunctionKind::Count => process(&settings.core, Count::<i64>::default(), cln_token).await,
        FunctionKind::Mean => process(&settings.core, Mean, cln_token).await,
    };

    if let Some(handle) = metrics_handle {
        handle.abort();
    }
    result
}

async fn process<F>(
    settings: &Settings,
    function: F,
    cln_token: CancellationToken,
) -> Result<(), Box<dyn Error>>
where
    F: WindowFunction<Input = i64>,
    F::Output: Serialize,
{
    let keyed = settings.window.keyed;
    let (output_tx, output_rx) = mpsc::channel(settings.window.channel_size);
    let runtime = WindowRuntime::start(
        &settings.window,
        Arc::new(function),
        Arc::new(MonotonicClock::new()),
        output_tx,
        cln_token.clone(),
    )?;

    let writer_handle = tokio::spawn(write_results(ReceiverStream::new(output_rx)));

    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    let mut input_result = Ok(());
    loop {
        let line = tokio::select! {
            _ = cln_token.cancelled() => break,
            line = lines.next() => line,
        };

        match line {
            Some(Ok(line)) => match parse_line(&line, keyed) {
                Ok(Some(input)) => {
                    if let Err(e) = runtime.send(input.key.as_deref(), input.value).await {
                        input_result = Err(e);
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(%e, "Skipping malformed input line"),
            },
            Some(Err(e)) => {
                error!(?e, "Failed to read from stdin");
                break;
            }
            None => {
                // windows keep firing on processing time until shutdown
                info!("Input closed, waiting for shutdown");
                cln_token.cancelled().await;
                break;
            }
        }
    }

    // a failed send means a partition stopped, its error is reported by shutdown
    let shutdown_result = runtime.shutdown().await;
    match writer_handle.await {
        Ok(Err(e)) => error!(?e, "Failed to write results"),
        Err(e) => error!(?e, "Result writer task failed"),
        Ok(Ok(())) => {}
    }

    shutdown_result?;
    input_result?;
    Ok(())
}

async fn write_results<O: Serialize>(
    mut results: ReceiverStream<WindowResult<O>>,
) -> std::io::Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(result) = results.next().await {
        let mut line = serde_json::to_vec(&result)?;
        line.push(b'\n');
        stdout.write_all(&line).await?;
        stdout.flush().await?;
    }
    Ok(())
}
