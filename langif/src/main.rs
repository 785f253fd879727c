use clap::Parser as ClapParser;
use std::{process, sync::Arc, thread, time::Instant};

use langif::{
    BindEntry, BoxApi, CollectingSink, Emitted, LogLevel, OutItem, Pattern, Record, Result,
    Runtime, RuntimeCreateInfo, StoreCreateInfo, TypeTag,
};

const BYTES: TypeTag = TypeTag(0x42);

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Number of records pushed through the pipeline
    #[arg(short, long, default_value_t = 1024)]
    records: usize,

    /// Payload size of every produced value
    #[arg(short, long, default_value_t = 256)]
    size: usize,

    /// Transformer threads
    #[arg(short, long, default_value_t = 4)]
    workers: usize,

    /// Limit for runtime owned payload bytes
    #[arg(long)]
    max_bytes: Option<usize>,

    /// Raise the default log filter, repeatable
    #[arg(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let sink = Arc::new(CollectingSink::new());
    let rt = Runtime::new(
        RuntimeCreateInfo {
            store: StoreCreateInfo {
                max_bytes: cli.max_bytes,
                ..Default::default()
            },
        },
        sink.clone(),
    );

    let start = Instant::now();
    if let Err(err) = pipeline(&cli, &rt, &sink) {
        eprintln!("pipeline failed: {err}");
        process::exit(1);
    }
    let elapsed = start.elapsed();

    let stats = rt.store().stats();
    println!(
        "{} records of {} bytes through {} workers in {:?}",
        cli.records, cli.size, cli.workers, elapsed
    );
    println!(
        "live records: {}, payload bytes: {}, slots: {}",
        stats.live_records, stats.ema_bytes, stats.slots
    );
}

fn pipeline(cli: &Cli, rt: &Runtime, sink: &CollectingSink) -> Result<()> {
    for i in 0..cli.records {
        rt.run(Record::empty(), |d| produce(d, i, cli.size))?;
    }
    let produced = sink.drain();
    log::info!("produced {} records", produced.len());

    let chunk = produced.len().div_ceil(cli.workers.max(1)).max(1);
    thread::scope(|s| {
        let handles: Vec<_> = produced
            .chunks(chunk)
            .map(|batch| {
                s.spawn(move || -> Result<()> {
                    for emitted in batch {
                        rt.run(emitted.record.clone(), |d| transform(d))?;
                    }
                    Ok(())
                })
            })
            .collect();
        handles.into_iter().try_for_each(|handle| {
            handle
                .join()
                .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
        })
    })?;

    let transformed = sink.drain();
    let mut checked = 0;
    for Emitted { record, .. } in transformed {
        rt.run(record, |d| {
            consume(d, cli.size)?;
            checked += 1;
            Ok(())
        })?;
    }
    log::info!("consumed {checked} records");
    Ok(())
}

fn produce(d: &mut impl BoxApi, index: usize, size: usize) -> Result<()> {
    let r = d.new(size, BYTES)?;
    d.with_access(r, |bytes| bytes.fill(index as u8))?;
    let r = d.demit(r);
    d.out(0, &[r.into(), OutItem::Tag(index as i64)])
}

/// Doubles a value by appending a copy of itself.
fn transform(d: &mut impl BoxApi) -> Result<()> {
    let bound = d.bind(&Pattern::new([BindEntry::Claim, BindEntry::Tag]))?;
    let (Some(r), Some(index)) = (bound[0].field(), bound[1].tag()) else {
        unreachable!("pattern was checked by bind");
    };

    let size = d.metadata(r)?.size;
    d.resize(r, size * 2)?;
    d.with_access(r, |bytes| {
        let (head, tail) = bytes.split_at_mut(size);
        tail.copy_from_slice(head);
    })?;
    if index % 1000 == 0 {
        d.log(LogLevel::INFO, format_args!("record {index} doubled to {}", size * 2));
    }

    let r = d.demit(r);
    d.out(1, &[r.into(), OutItem::Tag(index)])
}

fn consume(d: &mut impl BoxApi, size: usize) -> Result<()> {
    let bound = d.bind(&Pattern::new([BindEntry::Field, BindEntry::Tag]))?;
    let (Some(r), Some(index)) = (bound[0].field(), bound[1].tag()) else {
        unreachable!("pattern was checked by bind");
    };

    let intact = d.with_access(r, |bytes| {
        bytes.len() == size * 2 && bytes.iter().all(|&b| b == index as u8)
    })?;
    if !intact {
        d.log(LogLevel::ERROR, format_args!("record {index} came out corrupted"));
    }
    d.release(r)
}
