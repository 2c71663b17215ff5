use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;
use rand::Rng;

use eswap::zram::MockZram;
use eswap::{
    Area, Config, EswapEntry, ExtentManager, GroupPolicy, GroupSource, IOScheduler, ObjectFlags as Flag,
    ReclaimLoop, Stats, ZramAdapter,
};
use eswap_blockdev::FileBlockDevice;

#[derive(Parser)]
#[command(name = "eswap-cli", about = "Demonstration CLI for the eswap tiered compressed-memory engine")]
struct Cli {
    /// Master enable knob (spec §6.6).
    #[arg(long, default_value_t = true)]
    master_enable: bool,
    /// Reclaim-in enable knob.
    #[arg(long, default_value_t = true)]
    reclaim_in: bool,
    /// `error|warn|info|debug|trace`, forwarded to `env_logger`.
    #[arg(long, default_value = "info")]
    log_level: String,
    #[arg(long, default_value_t = 60)]
    watchdog_expire_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Runs the single-object round trip and the multi-object packing
    /// scenario of spec.md §8 against a temp-file-backed device.
    Demo,
    /// Prints global counters for a freshly constructed engine (this CLI
    /// has no persistent daemon process to attach to; it exists to show
    /// the counter shape, not to report a running system's state).
    Stat,
}

/// A single always-on resource group, standing in for the external
/// memory-cgroup hierarchy a real deployment would supply.
struct DemoGroups;

impl GroupSource for DemoGroups {
    fn mcg_ids(&self) -> Vec<u32> {
        vec![1]
    }
    fn policy(&self, _mcg_id: u32) -> GroupPolicy {
        GroupPolicy { ratio: 100, ..Default::default() }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    std::env::set_var("RUST_LOG", format!("eswap={},eswap_cli={}", cli.log_level, cli.log_level));
    env_logger::init();

    match cli.command {
        Command::Demo => run_demo(&cli),
        Command::Stat => run_stat(),
    }
}

fn run_demo(cli: &Cli) -> Result<()> {
    let config = Arc::new(Config::new());
    config.set_master_enable(cli.master_enable);
    config.set_watchdog_expire_secs(cli.watchdog_expire_secs);

    let nr_objs = 64;
    let area = Arc::new(Area::create(nr_objs, 32, 8));
    let zram = Arc::new(MockZram::new(nr_objs));
    let zram_dyn: Arc<dyn ZramAdapter> = zram.clone();
    let stats = Arc::new(Stats::new());
    let extent_manager = Arc::new(ExtentManager::new(area.clone(), zram_dyn.clone(), stats.clone()));
    let io = Arc::new(IOScheduler::new(2, 1));

    let suffix: u32 = rand::thread_rng().gen();
    let device_path = std::env::temp_dir().join(format!("eswap-cli-{suffix:08x}.img"));
    let device: Arc<dyn eswap::BlockDevice> = Arc::new(FileBlockDevice::create(&device_path, 512, 4096)?);
    info!("backing store at {}", device_path.display());

    let groups: Arc<dyn GroupSource> = Arc::new(DemoGroups);
    let reclaim = ReclaimLoop::new(config.clone(), extent_manager.clone(), zram_dyn.clone(), io, device, groups);

    info!("writing {nr_objs} zram slots into group 1");
    for index in 0..nr_objs {
        let handle = zram.alloc_buf(4096);
        zram.write_buf(handle, &vec![(index % 251) as u8; 4096]);
        zram.set_handle(index, handle);
        zram.set_obj_size(index, 4096);
        zram.set_memcg(index, 1);
        extent_manager.track(index, 1);
    }
    print_stats("after track", &stats);

    reclaim.set_reclaim_in_enable(cli.reclaim_in);
    let granted = reclaim.reclaim_in(64 * 4096);
    info!("reclaim_in granted {granted} bytes");
    // This demo has no caller polling a completion event for the
    // background reclaim task; a short sleep is a reasonable stand-in for
    // one round of CLI output, not a synchronization primitive.
    std::thread::sleep(Duration::from_millis(300));
    print_stats("after reclaim_in", &stats);

    info!("faulting slot 0 back in");
    zram.slot_lock(0);
    if zram.test_flag(0, Flag::WB) {
        let entry = EswapEntry::decode(zram.get_handle(0));
        info!("slot 0 resolved to extent {}", entry.ext_id);
        reclaim.fault_out(0)?;
    }
    zram.slot_unlock(0);
    print_stats("after fault_out", &stats);

    Ok(())
}

fn run_stat() -> Result<()> {
    let stats = Stats::new();
    print_stats("fresh engine", &stats);
    Ok(())
}

fn print_stats(label: &str, stats: &Stats) {
    println!("--- {label} ---");
    println!("zram_stored_pages  = {}", stats.zram_stored_pages.load(Ordering::Relaxed));
    println!("stored_pages       = {}", stats.stored_pages.load(Ordering::Relaxed));
    println!("faultout_pages     = {}", stats.faultout_pages.load(Ordering::Relaxed));
    println!("miss_free          = {}", stats.miss_free.load(Ordering::Relaxed));
}
