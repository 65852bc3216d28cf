// SPDX-License-Identifier: AGPL-3.0-or-later

use nanocol::options::parse_delimiter;
use nanocol::{BuildOptions, CompressionMode, IndexSpec, QueryOptions, ReadOptions, Table};
use std::env;
use std::io::{self, Write};
use std::path::Path;
use tracing_subscriber::EnvFilter;

fn main() {
    let mut args: Vec<String> = env::args().skip(1).collect();
    let verbose = match args.iter().position(|a| a == "--verbose" || a == "-v") {
        Some(i) => {
            args.remove(i);
            true
        }
        None => false,
    };
    init_tracing(verbose);

    let Some(cmd) = args.first().cloned() else {
        print_usage_and_exit(2);
    };
    let rest = &args[1..];
    let result = match cmd.as_str() {
        "convert" => cmd_convert(rest),
        "head" => cmd_head_tail(rest, false),
        "tail" => cmd_head_tail(rest, true),
        "info" => cmd_info(rest),
        "index" => cmd_index(rest),
        "version" | "--version" => {
            println!("nanocol {}", nanocol::version());
            Ok(())
        }
        "help" | "--help" | "-h" => print_usage_and_exit(0),
        other => {
            eprintln!("unknown command: {other}");
            print_usage_and_exit(2);
        }
    };
    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "nanocol=debug" } else { "off" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn flag_value<'a>(args: &'a [String], i: usize, flag: &str) -> &'a str {
    args.get(i + 1).map(String::as_str).unwrap_or_else(|| {
        eprintln!("{flag} needs a value");
        print_usage_and_exit(2);
    })
}

fn parse_threads(v: &str) -> usize {
    match v.parse::<usize>() {
        Ok(n) if n > 0 => n,
        _ => {
            eprintln!("--threads must be a positive integer: {v}");
            print_usage_and_exit(2);
        }
    }
}

fn cmd_convert(args: &[String]) -> nanocol::Result<()> {
    if args.len() < 2 {
        print_usage_and_exit(2);
    }
    let (src, dst) = (&args[0], &args[1]);
    let mut opts = BuildOptions::default();
    let mut i = 2usize;
    while i < args.len() {
        match args[i].as_str() {
            "--delimiter" => opts.delimiter = parse_delimiter(flag_value(args, i, "--delimiter"))?,
            "--compress" => {
                opts.compression = CompressionMode::parse(flag_value(args, i, "--compress"))?
            }
            "--threads" => opts.parallelism = parse_threads(flag_value(args, i, "--threads")),
            "--index" => {
                let v = flag_value(args, i, "--index");
                opts.index_columns.push(match v.split_once(',') {
                    Some((a, b)) => IndexSpec::Pair(a.to_string(), b.to_string()),
                    None => IndexSpec::Column(v.to_string()),
                });
            }
            "--reverse-index" => {
                let v = flag_value(args, i, "--reverse-index");
                opts.index_columns.push(IndexSpec::Reversed(v.to_string()));
            }
            "--no-comments" => {
                opts.comment_prefix = None;
                i += 1;
                continue;
            }
            other => {
                eprintln!("unknown option: {other}");
                print_usage_and_exit(2);
            }
        }
        i += 2;
    }
    let table = nanocol::convert(src, dst, &opts)?;
    println!(
        "wrote {} ({} rows, {} columns)",
        dst,
        table.num_rows(),
        table.num_columns()
    );
    Ok(())
}

fn cmd_head_tail(args: &[String], tail: bool) -> nanocol::Result<()> {
    if args.len() < 2 {
        print_usage_and_exit(2);
    }
    let n = args[1].parse::<usize>().unwrap_or_else(|_| {
        eprintln!("row count must be an integer: {}", args[1]);
        print_usage_and_exit(2);
    });
    let cols: Vec<&str> = args[2..].iter().map(String::as_str).collect();
    let select = (!cols.is_empty()).then_some(cols.as_slice());
    let stdout = io::stdout();
    let mut out = io::BufWriter::new(stdout.lock());
    let opts = QueryOptions::default();
    if tail {
        nanocol::tail(&args[0], n, select, &mut out, &opts)?;
    } else {
        nanocol::head(&args[0], n, select, &mut out, &opts)?;
    }
    out.flush()?;
    Ok(())
}

fn cmd_info(args: &[String]) -> nanocol::Result<()> {
    let Some(path) = args.first() else {
        print_usage_and_exit(2);
    };
    let table = Table::open(path, ReadOptions::default())?;
    println!("rows\t{}", table.num_rows());
    println!("columns\t{}", table.num_columns());
    println!("row width\t{}", table.row_width());
    for name in table.column_names()? {
        let col = table.column(&name)?;
        println!(
            "{}\t{}\twidth={}\tcompression={:?}",
            col.name,
            col.col_type,
            col.width(),
            col.compression
        );
    }
    for (spec, path) in nanocol::indexes(path)? {
        println!("index\t{spec:?}\t{}", path.display());
    }
    Ok(())
}

fn cmd_index(args: &[String]) -> nanocol::Result<()> {
    let reverse = args.iter().any(|a| a == "--reverse");
    let mut threads = None;
    let mut positional: Vec<&str> = Vec::new();
    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "--reverse" => i += 1,
            "--threads" => {
                threads = Some(parse_threads(flag_value(args, i, "--threads")));
                i += 2;
            }
            other => {
                positional.push(other);
                i += 1;
            }
        }
    }
    let mut opts = BuildOptions::default();
    if let Some(t) = threads {
        opts.parallelism = t;
    }
    let path = match positional.as_slice() {
        [table, col] => nanocol::build_single(Path::new(table), col, reverse, &opts)?,
        [table, a, b] if !reverse => nanocol::build_pair(Path::new(table), a, b, &opts)?,
        _ => print_usage_and_exit(2),
    };
    println!("wrote {}", path.display());
    Ok(())
}

fn print_usage_and_exit(code: i32) -> ! {
    eprintln!("usage:");
    eprintln!("  nanocol convert <src> <dst> [options]");
    eprintln!("  nanocol head <table> <n> [columns...]");
    eprintln!("  nanocol tail <table> <n> [columns...]");
    eprintln!("  nanocol info <table>");
    eprintln!("  nanocol index <table> <column> [column2] [--reverse] [--threads N]");
    eprintln!("  nanocol version");
    eprintln!();
    eprintln!("convert options:");
    eprintln!("  --delimiter <C>          field delimiter, one byte or \\t (default tab)");
    eprintln!("  --compress <MODE>        none | dictionary | block (default none)");
    eprintln!("  --index <COL[,COL2]>     build an index (repeatable)");
    eprintln!("  --reverse-index <COL>    build a suffix index on a string column");
    eprintln!("  --threads <N>            worker threads (default NANOCOL_THREADS or all cores)");
    eprintln!("  --no-comments            do not skip lines starting with #");
    eprintln!();
    eprintln!("global: --verbose logs progress to stderr (RUST_LOG overrides)");
    std::process::exit(code)
}
