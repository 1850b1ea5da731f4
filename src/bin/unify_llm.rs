//! unify-llm CLI: 按配置文件批量生成并输出 JSON
//!
//! Usage:
//!   unify-llm generate --config <path> [--set <key=value>]... [--repeat <n>]
//!                      [--template <name>] [--system <text>] <prompt>... | -
//!   unify-llm show-config --config <path> [--set <key=value>]...

use anyhow::{bail, Context, Result};
use std::io::BufRead;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use unify_llm::{AppConfig, GenerateOptions, GenerationRequest, Generator, InstancePool};

#[derive(Debug, Default)]
struct Args {
    config: Option<String>,
    overrides: Vec<(String, String)>,
    repeat: u32,
    template: Option<String>,
    system: String,
    prompts: Vec<String>,
}

fn parse_args(raw: &[String]) -> Result<Args> {
    let mut args = Args {
        repeat: 1,
        ..Default::default()
    };
    let mut iter = raw.iter();
    while let Some(arg) = iter.next() {
        let mut value = |flag: &str| {
            iter.next()
                .cloned()
                .with_context(|| format!("{flag} expects a value"))
        };
        match arg.as_str() {
            "--config" | "-c" => args.config = Some(value("--config")?),
            "--set" => {
                let pair = value("--set")?;
                let (key, val) = pair
                    .split_once('=')
                    .with_context(|| format!("--set expects key=value, got {pair}"))?;
                args.overrides.push((key.to_string(), val.to_string()));
            }
            "--repeat" | "-n" => {
                args.repeat = value("--repeat")?.parse().context("--repeat expects a number")?
            }
            "--template" => args.template = Some(value("--template")?),
            "--system" => args.system = value("--system")?,
            "-" => {
                for line in std::io::stdin().lock().lines() {
                    let line = line?;
                    if !line.trim().is_empty() {
                        args.prompts.push(line);
                    }
                }
            }
            flag if flag.starts_with("--") => bail!("unknown option: {flag}"),
            prompt => args.prompts.push(prompt.to_string()),
        }
    }
    Ok(args)
}

fn load_config(args: &Args) -> Result<AppConfig> {
    let path = args.config.as_deref().context("--config is required")?;
    let mut config = AppConfig::from_yaml_file(path)?;
    for (key, value) in &args.overrides {
        config
            .apply_override(key, value)
            .with_context(|| format!("invalid override {key}={value}"))?;
    }
    Ok(config)
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("unify_llm=info")))
        .init();
}

async fn cmd_generate(args: Args) -> Result<()> {
    if args.prompts.is_empty() {
        bail!("no prompts given");
    }
    let config = load_config(&args)?;
    let pool = InstancePool::default();
    let generator = Generator::from_config(&pool, &config).await?;

    let requests: Vec<GenerationRequest> = args
        .prompts
        .iter()
        .map(|p| GenerationRequest::from_prompt(p.clone(), args.system.clone()))
        .collect();
    let mut options = GenerateOptions::new().with_repeat_count(args.repeat);
    if let Some(template) = args.template.clone() {
        options = options.with_prompt_template(template);
    }

    let outcome = generator.generate(&requests, options).await;
    generator.shutdown().await?;
    pool.shutdown_all().await;

    println!("{}", serde_json::to_string_pretty(&outcome?)?);
    Ok(())
}

fn cmd_show_config(args: Args) -> Result<()> {
    let config = load_config(&args)?;
    let mut value = serde_json::to_value(&config)?;
    value["model_config"] = config.model_config.redacted();
    println!("{}", serde_yaml::to_string(&value)?);
    Ok(())
}

fn print_usage() {
    println!(
        r#"unify-llm: 统一生成命令行工具

USAGE:
    unify-llm <COMMAND> [OPTIONS]

COMMANDS:
    generate       Generate responses for the given prompts ("-" reads prompts from stdin)
    show-config    Print the effective configuration with credentials removed
    help           Show this help message

OPTIONS:
    -c, --config <path>     YAML configuration file
        --set <key=value>   Override a dotted configuration key
    -n, --repeat <n>        Samples per prompt (default 1)
        --template <name>   Prompt builder name
        --system <text>     System prompt

ENVIRONMENT:
    RUST_LOG                Log filter (default unify_llm=info)"#
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let raw: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = raw.first() else {
        print_usage();
        std::process::exit(1);
    };

    init_tracing();
    match command.as_str() {
        "generate" => cmd_generate(parse_args(&raw[1..])?).await,
        "show-config" => cmd_show_config(parse_args(&raw[1..])?),
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            std::process::exit(1);
        }
    }
}
