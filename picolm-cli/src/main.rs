use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use log::error;
use std::io::{self, BufRead, Write};
use std::path::Path;

use picolm_inference::configuration::{CacheScalePolicy, ModelConfig};
use picolm_inference::store::{DirMedium, PageJournal, PageStore};
use picolm_inference::weights::{INDEX_OBJECT, ModelIndex};
use picolm_inference::{InferenceConfigBuilder, run_inference};

fn model_args(cmd: Command) -> Command {
    cmd.arg(
        Arg::new("MODEL_DIR")
            .help("Directory holding index.json and the page files")
            .required(true)
            .index(1),
    )
    .arg(
        Arg::new("dim")
            .long("dim")
            .value_name("INT")
            .help("Hidden dimension [default: 64]")
            .default_value("64")
            .value_parser(clap::value_parser!(usize)),
    )
    .arg(
        Arg::new("heads")
            .long("heads")
            .value_name("INT")
            .help("Attention head count [default: 2]")
            .default_value("2")
            .value_parser(clap::value_parser!(usize)),
    )
    .arg(
        Arg::new("ffn")
            .long("ffn")
            .value_name("INT")
            .help("Feed-forward width [default: 256]")
            .default_value("256")
            .value_parser(clap::value_parser!(usize)),
    )
    .arg(
        Arg::new("layers")
            .long("layers")
            .value_name("INT")
            .help("Decoder layer count [default: 2]")
            .default_value("2")
            .value_parser(clap::value_parser!(usize)),
    )
    .arg(
        Arg::new("context")
            .short('c')
            .long("context")
            .value_name("INT")
            .help("Context window / KV-cache capacity [default: 64]")
            .default_value("64")
            .value_parser(clap::value_parser!(usize)),
    )
    .arg(
        Arg::new("page-size")
            .long("page-size")
            .value_name("BYTES")
            .help("Storage page size [default: 512]")
            .default_value("512")
            .value_parser(clap::value_parser!(usize)),
    )
}

fn generate_subcommand() -> Command {
    model_args(
        Command::new("generate").about("Run byte-level autoregressive decoding over paged weights"),
    )
    .arg(
        Arg::new("input")
            .short('i')
            .long("input")
            .value_name("STRING")
            .help("Prompt text")
            .required(true),
    )
    .arg(
        Arg::new("temperature")
            .short('t')
            .long("temperature")
            .value_name("FLOAT")
            .help("Sampling temperature, 0 for greedy [default: 1.0]")
            .default_value("1.0")
            .value_parser(clap::value_parser!(f32)),
    )
    .arg(
        Arg::new("seed")
            .short('s')
            .long("seed")
            .value_name("INT")
            .help("Random seed")
            .value_parser(clap::value_parser!(u64)),
    )
    .arg(
        Arg::new("tokens")
            .short('n')
            .long("tokens")
            .value_name("INT")
            .help("Tokens to generate past the prompt [default: 64]")
            .default_value("64")
            .value_parser(clap::value_parser!(usize)),
    )
    .arg(
        Arg::new("kv-scale")
            .long("kv-scale")
            .value_name("STRING")
            .help("KV-cache scale policy: first|per-step [default: first]")
            .default_value("first"),
    )
}

fn console_subcommand() -> Command {
    model_args(Command::new("console").about("Interactive page-metadata diagnostic console"))
}

fn model_config(matches: &ArgMatches) -> ModelConfig {
    ModelConfig {
        dim: *matches.get_one::<usize>("dim").unwrap(),
        n_heads: *matches.get_one::<usize>("heads").unwrap(),
        d_ff: *matches.get_one::<usize>("ffn").unwrap(),
        max_seq: *matches.get_one::<usize>("context").unwrap(),
        n_layers: *matches.get_one::<usize>("layers").unwrap(),
        page_size: *matches.get_one::<usize>("page-size").unwrap(),
        ..ModelConfig::default()
    }
}

fn run_generate_command(matches: &ArgMatches) -> Result<()> {
    let policy = match matches.get_one::<String>("kv-scale").unwrap().as_str() {
        "first" => CacheScalePolicy::FixedAtFirst,
        "per-step" => CacheScalePolicy::PerStep,
        other => anyhow::bail!("unknown kv-scale policy: {other}"),
    };

    let config = InferenceConfigBuilder::default()
        .model_dir(matches.get_one::<String>("MODEL_DIR"))
        .model(model_config(matches))
        .scale_policy(Some(policy))
        .temperature(matches.get_one::<f32>("temperature").copied())
        .seed(matches.get_one::<u64>("seed").copied())
        .prompt(matches.get_one::<String>("input"))
        .max_new_tokens(matches.get_one::<usize>("tokens").copied())
        .build()?;

    run_inference(config).map_err(|e| anyhow::anyhow!("inference failed: {e}"))
}

/// Walks every page file the manifest lists through the store once, so the
/// journal has something to show.
fn warm_journal(store: &mut PageStore<DirMedium>) -> Result<()> {
    let manifest = store
        .read_whole(INDEX_OBJECT)
        .context("failed to read manifest")?;
    let index = ModelIndex::parse(&manifest)?;
    for name in index.page_names() {
        // A missing page is worth seeing in the console, not fatal to it.
        if let Err(e) = store.read_page(&name) {
            eprintln!("warning: {e}");
        }
    }
    Ok(())
}

fn print_page_meta(journal: &PageJournal, idx: usize) {
    match journal.entry(idx) {
        Some(meta) => println!(
            "page {idx} wc={} tag={} hash[0]={:02x}",
            meta.write_count,
            meta.tag_str(),
            meta.hash[0]
        ),
        None => println!("invalid page idx"),
    }
}

fn print_menu() {
    println!("picolm console: [S]tatus  [P]age <id>  [R]eset meta  [H]elp");
}

fn run_console_command(matches: &ArgMatches) -> Result<()> {
    let dir = matches.get_one::<String>("MODEL_DIR").unwrap();
    if !Path::new(dir).is_dir() {
        anyhow::bail!("{dir} is not a directory");
    }

    let page_size = *matches.get_one::<usize>("page-size").unwrap();
    let mut store = PageStore::open(DirMedium::new(dir), page_size)?.with_journal(PageJournal::new());
    warm_journal(&mut store)?;

    print_menu();
    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }

        match line.trim().chars().next() {
            Some('S' | 's') => {
                let journal = store.journal().context("journal missing")?;
                for idx in 0..10 {
                    print_page_meta(journal, idx);
                }
            }
            Some('P' | 'p') => {
                println!("enter page id:");
                let mut id_line = String::new();
                if stdin.lock().read_line(&mut id_line)? == 0 {
                    break;
                }
                match id_line.trim().parse::<usize>() {
                    Ok(idx) => {
                        let journal = store.journal().context("journal missing")?;
                        print_page_meta(journal, idx);
                    }
                    Err(_) => println!("invalid page idx"),
                }
            }
            Some('R' | 'r') => {
                if let Some(journal) = store.journal_mut() {
                    journal.reset();
                }
                store.sync_metadata();
                println!("metadata reset");
            }
            None => {}
            _ => print_menu(),
        }
    }
    Ok(())
}

fn execute_commands() -> Result<()> {
    // Clean log lines, no timestamp/module prefix.
    env_logger::Builder::from_default_env()
        .format(|buf, record| {
            use std::io::Write;
            writeln!(buf, "{}", record.args())
        })
        .init();

    let matches = Command::new("picolm")
        .about("picolm CLI: run a paged int8 transformer straight off block storage")
        .subcommand(generate_subcommand())
        .subcommand(console_subcommand())
        .get_matches();

    match matches.subcommand() {
        Some(("generate", matches)) => run_generate_command(matches),
        Some(("console", matches)) => run_console_command(matches),
        _ => anyhow::bail!("No subcommand specified. Use -h to print help information."),
    }
}

fn main() {
    if let Err(e) = execute_commands() {
        error!("Error: {e}");
        std::process::exit(1);
    }
}
