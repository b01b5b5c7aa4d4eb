use std::sync::Arc;

use anyhow::Context;
use ferry::{BridgeConfig, Callback, HostBuilder, Page, WorkerSource};
use futures_lite::io::{AsyncBufReadExt, BufReader};
use futures_lite::{StreamExt, future};
use serde_json::{Value, json};

use crate::cli::WorkerArgs;
use crate::commands::invoke::parse_arg;
use crate::error::CliResult;

enum Input {
    Line(Option<std::io::Result<String>>),
    Exit(Option<i64>),
    Interrupt,
}

pub async fn execute(args: WorkerArgs, config: BridgeConfig) -> CliResult<()> {
    let (events_tx, events_rx) = smol::channel::unbounded();
    let host = HostBuilder::new().config(config).build(events_tx);
    let page = Page::new(Arc::clone(&host));
    let pump = tokio::spawn({
        let page = page.clone();
        async move { page.pump(events_rx).await }
    });

    let source = if args.inline {
        let code = std::fs::read(&args.source)
            .with_context(|| format!("failed to read worker source: {}", args.source))?;
        WorkerSource::Code(code)
    } else {
        WorkerSource::from(args.source.as_str())
    };
    let worker = page.create_worker(source, json!({ "argv": args.argv })).await?;

    let (exit_tx, exit_rx) = smol::channel::bounded::<Option<i64>>(1);
    let print: Callback = Arc::new(|events: Vec<Value>| {
        for event in events {
            println!("{event}");
        }
    });
    let on_exit: Callback = Arc::new(move |events: Vec<Value>| {
        let code = events.first().and_then(|event| event["data"].as_i64());
        let _ = exit_tx.try_send(code);
    });
    worker.add_event_listener("message", &print).await?;
    worker.add_event_listener("error", &print).await?;
    worker.add_event_listener("exit", &on_exit).await?;

    // Post stdin lines until EOF, then wait for the worker to finish on its own
    let mut lines = BufReader::new(smol::Unblock::new(std::io::stdin())).lines();
    let mut stdin_open = true;
    let exit_code = loop {
        let next_line = async {
            if stdin_open {
                Input::Line(lines.next().await)
            } else {
                future::pending().await
            }
        };
        let exited = async { Input::Exit(exit_rx.recv().await.ok().flatten()) };
        let interrupted = async {
            let _ = tokio::signal::ctrl_c().await;
            Input::Interrupt
        };

        let input = future::or(next_line, future::or(exited, interrupted)).await;
        match input {
            Input::Line(Some(Ok(line))) => worker.post_message(parse_arg(&line)).await?,
            Input::Line(Some(Err(e))) => return Err(e).context("failed to read stdin"),
            Input::Line(None) => {
                tracing::debug!("stdin closed, waiting for worker to exit");
                stdin_open = false;
            }
            Input::Exit(code) => break code,
            Input::Interrupt => break None,
        }
    };

    page.before_unload().await?;
    pump.abort();

    let diagnostics = host.diagnostics();
    tracing::debug!(
        unknown_beacons = diagnostics.unknown_beacons(),
        unknown_actions = diagnostics.unknown_actions(),
        finalized_callbacks = diagnostics.finalized_callbacks(),
        "bridge diagnostics"
    );

    match exit_code {
        Some(code) if code != 0 => anyhow::bail!("worker exited with code {code}"),
        _ => Ok(()),
    }
}
