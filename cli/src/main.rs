//! chainrelay CLI: submit and track bundles from the terminal.
//!
//! Usage:
//! ```bash
//! # Submit a bundle of base58 wire transactions
//! chainrelay send-bundle --tx <TX> --tx <TX> --region NY
//!
//! # Submit, then wait for the relay's verdict and ledger confirmation
//! chainrelay send-bundle --tx <TX> --confirm --rpc https://api.mainnet-beta.solana.com
//!
//! # Check on earlier bundles
//! chainrelay inflight-status --id <BUNDLE_ID>
//!
//! # One transaction, forwarded only inside a bundle, through a proxy
//! chainrelay send-transaction --tx <TX> --bundle-only --proxy 10.0.0.1:3128:user:pass
//! ```

mod logging;

use std::env;
use std::process;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tokio_util::sync::CancellationToken;

use chainrelay_bundle::{BundlePipeline, PipelineConfig};
use chainrelay_core::bundle::Bundle;
use chainrelay_core::endpoints::{Region, REGIONS};
use chainrelay_core::ledger::SignatureStatusLookup;
use chainrelay_core::proxy::ProxyConfig;
use chainrelay_core::relay::CallMetadata;
use chainrelay_core::transaction::{Encoding, Signature, Transaction};
use chainrelay_http::{
    BundleApi, BundleApiConfig, HttpClientConfig, HttpSearcher, InflightStatusPoller,
    PollerConfig, RpcLedger, DEFAULT_BUNDLES_URL,
};

use logging::{init_tracing, LogConfig};

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    init_tracing(&LogConfig {
        level: parse_flag(&args, "--log-level").unwrap_or_else(|| "warn".into()),
        json: has_flag(&args, "--log-json"),
        ..Default::default()
    });

    let result = match args[1].as_str() {
        "send-bundle" => cmd_send_bundle(&args[2..]).await,
        "send-transaction" => cmd_send_transaction(&args[2..]).await,
        "bundle-status" => cmd_bundle_status(&args[2..]).await,
        "inflight-status" => cmd_inflight_status(&args[2..]).await,
        "signature-status" => cmd_signature_status(&args[2..]).await,
        "regions" => {
            cmd_regions();
            Ok(())
        }
        "version" | "--version" | "-V" => {
            println!("chainrelay {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("chainrelay {}", env!("CARGO_PKG_VERSION"));
    println!("Submit transaction bundles to the relay and track them\n");
    println!("USAGE:");
    println!("    chainrelay <COMMAND> [FLAGS]\n");
    println!("COMMANDS:");
    println!("    send-bundle       Submit 1-5 signed transactions as one bundle");
    println!("    send-transaction  Submit one signed transaction");
    println!("    bundle-status     Status of landed bundles");
    println!("    inflight-status   Status of bundles from the last five minutes");
    println!("    signature-status  Ledger status of transaction signatures");
    println!("    regions           List known relay regions");
    println!("    version           Print version");
    println!("    help              Print this help\n");
    println!("RELAY FLAGS:");
    println!("    --url <URL>         Bundle endpoint  [default: {DEFAULT_BUNDLES_URL}]");
    println!("    --region <CODE>     Use a region's block engine instead of --url");
    println!("    --proxy <PROXY>     HOST:PORT:USERNAME:PASSWORD forward proxy\n");
    println!("SEND-BUNDLE FLAGS:");
    println!("    --tx <TX>           Wire transaction, repeatable  [required]");
    println!("    --encoding <ENC>    base58 | base64  [default: base58]");
    println!("    --confirm           Wait for the verdict and ledger confirmation");
    println!("    --rpc <URL>         Ledger RPC endpoint  [required with --confirm]");
    println!("    --timeout-ms <MS>   Ledger confirmation bound  [default: 15000]\n");
    println!("SEND-TRANSACTION FLAGS:");
    println!("    --tx <TX>           Wire transaction  [required]");
    println!("    --encoding <ENC>    base58 | base64  [default: base58]");
    println!("    --bundle-only       Only forward the transaction inside a bundle\n");
    println!("STATUS FLAGS:");
    println!("    --id <BUNDLE_ID>    Repeatable; more than 5 are batched");
    println!("    --sig <SIGNATURE>   Repeatable (signature-status)");
    println!("    --rpc <URL>         Ledger RPC endpoint (signature-status)\n");
    println!("LOGGING:");
    println!("    --log-level <LVL>   trace | debug | info | warn | error  [default: warn]");
    println!("    --log-json          Emit JSON logs on stderr");
    println!("    {}            Overrides --log-level", logging::LOG_ENV);
}

async fn cmd_send_bundle(args: &[String]) -> Result<()> {
    let encoding = match parse_flag(args, "--encoding") {
        Some(e) => Encoding::from_str(&e)?,
        None => Encoding::default(),
    };
    let raw = parse_all(args, "--tx");
    if raw.is_empty() {
        bail!("at least one --tx is required");
    }
    let transactions = raw
        .iter()
        .enumerate()
        .map(|(i, s)| Transaction::decode(s, encoding).with_context(|| format!("--tx #{}", i + 1)))
        .collect::<Result<Vec<_>>>()?;

    let api = bundle_api(args)?;

    if !has_flag(args, "--confirm") {
        let bundle = Bundle::assemble(transactions)?;
        let bundle_id = api.send_bundle(&bundle, encoding).await?;
        println!("{bundle_id}");
        return Ok(());
    }

    let rpc = parse_flag(args, "--rpc").ok_or_else(|| anyhow!("--rpc is required with --confirm"))?;
    let mut config = PipelineConfig::default();
    if let Some(ms) = parse_flag(args, "--timeout-ms") {
        config.confirm_timeout_ms = ms.parse().context("--timeout-ms")?;
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    let pipeline = BundlePipeline::new(
        Arc::new(HttpSearcher::new(api.clone()).with_encoding(encoding)),
        Arc::new(CallMetadata::new()),
        Arc::new(InflightStatusPoller::new(api, PollerConfig::default())),
        Arc::new(RpcLedger::http(rpc)?),
        config,
        cancel,
    );

    let confirmation = pipeline.send_and_confirm(transactions).await?;
    println!("  Bundle:        {}", confirmation.bundle_id);
    println!("  Accepted slot: {}", confirmation.accepted_slot);
    println!("  Ledger wait:   {}ms", confirmation.ledger_wait.as_millis());
    for status in &confirmation.statuses {
        println!("  Landed:        slot {} ({:?})", status.slot, status.status());
    }
    Ok(())
}

async fn cmd_send_transaction(args: &[String]) -> Result<()> {
    let encoding = match parse_flag(args, "--encoding") {
        Some(e) => Encoding::from_str(&e)?,
        None => Encoding::default(),
    };
    let raw = parse_flag(args, "--tx").ok_or_else(|| anyhow!("--tx is required"))?;
    let tx = Transaction::decode(&raw, encoding).context("--tx")?;

    let receipt = bundle_api(args)?
        .send_transaction(&tx, encoding, has_flag(args, "--bundle-only"))
        .await?;
    println!("  Signature:     {}", receipt.signature);
    if let Some(bundle_id) = &receipt.bundle_id {
        println!("  Bundle:        {bundle_id}");
    }
    Ok(())
}

async fn cmd_bundle_status(args: &[String]) -> Result<()> {
    let ids = required_ids(args)?;
    let statuses = bundle_api(args)?.batch_get_bundle_statuses(&ids).await?;
    println!("{}", serde_json::to_string_pretty(&statuses)?);
    Ok(())
}

async fn cmd_inflight_status(args: &[String]) -> Result<()> {
    let ids = required_ids(args)?;
    let statuses = bundle_api(args)?
        .batch_get_inflight_bundle_statuses(&ids)
        .await?;
    println!("{}", serde_json::to_string_pretty(&statuses)?);
    Ok(())
}

async fn cmd_signature_status(args: &[String]) -> Result<()> {
    let rpc = parse_flag(args, "--rpc").ok_or_else(|| anyhow!("--rpc is required"))?;
    let signatures = parse_all(args, "--sig")
        .iter()
        .map(|s| Signature::from_str(s).with_context(|| format!("bad signature {s}")))
        .collect::<Result<Vec<_>>>()?;
    if signatures.is_empty() {
        bail!("at least one --sig is required");
    }

    let statuses = RpcLedger::http(rpc)?
        .get_signature_statuses(&signatures)
        .await?;
    for (sig, status) in signatures.iter().zip(&statuses) {
        match status {
            Some(s) => println!("{sig}  slot {}  {:?}", s.slot, s.status()),
            None => println!("{sig}  not found"),
        }
    }
    Ok(())
}

fn cmd_regions() {
    println!("Known relay regions:\n");
    for region in REGIONS {
        println!("  {:<13} {}", region.code, region.name);
        println!("                Block engine:   {}", region.block_engine_url);
        println!("                Relayer:        {}", region.relayer_url);
        println!("                Shred receiver: {}", region.shred_receiver_addr);
        println!("                NTP:            {}", region.ntp_host);
        println!();
    }
}

fn bundle_api(args: &[String]) -> Result<BundleApi> {
    let url = match (parse_flag(args, "--region"), parse_flag(args, "--url")) {
        (Some(_), Some(_)) => bail!("--region and --url are mutually exclusive"),
        (Some(code), None) => Region::resolve(&code)?.bundles_url(),
        (None, Some(url)) => url,
        (None, None) => DEFAULT_BUNDLES_URL.to_string(),
    };
    let proxy = parse_flag(args, "--proxy")
        .map(|p| ProxyConfig::from_str(&p).context("--proxy"))
        .transpose()?;
    Ok(BundleApi::new(BundleApiConfig {
        url,
        http: HttpClientConfig {
            proxy,
            ..Default::default()
        },
        ..Default::default()
    })?)
}

fn required_ids(args: &[String]) -> Result<Vec<String>> {
    let ids = parse_all(args, "--id");
    if ids.is_empty() {
        bail!("at least one --id is required");
    }
    Ok(ids)
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}

fn parse_all(args: &[String], flag: &str) -> Vec<String> {
    args.windows(2)
        .filter(|w| w[0] == flag)
        .map(|w| w[1].clone())
        .collect()
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}
