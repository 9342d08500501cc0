//! Command implementations

use std::thread;
use std::time::{Duration, Instant};

use colored::Colorize;
use nexum_card_resource::{
    CardDriver, CardResourceService, CardStatus, MonitorState, ReaderEvent, ResourceState,
};
use tracing::debug;

/// List the plugins of the driver with their readers
pub(crate) fn plugins(driver: &impl CardDriver) -> eyre::Result<()> {
    let plugins = driver.list_plugins()?;
    if plugins.is_empty() {
        println!("No plugins found!");
        return Ok(());
    }

    println!("Available plugins:");
    for (i, plugin) in plugins.iter().enumerate() {
        println!("{}. {}", i + 1, plugin.bold());

        // The stream starts with a replay of the connected readers
        let readers: Vec<ReaderEvent> = driver.observe_reader_events(plugin)?.try_iter().collect();
        if readers.is_empty() {
            println!("   no reader");
        }
        for event in readers {
            if let ReaderEvent::Added { reader, card } = event {
                let status = match card {
                    CardStatus::Present { atr } => {
                        format!("card present, ATR {}", hex::encode_upper(atr)).green()
                    }
                    CardStatus::Absent => "no card".normal(),
                    CardStatus::Unreadable(reason) => format!("unreadable: {reason}").red(),
                };
                println!("   {reader} ({status})");
            }
        }
    }
    Ok(())
}

/// Print every pool with its resources
pub(crate) fn status(service: &CardResourceService) -> eyre::Result<()> {
    let status = service.status()?;

    for (plugin, state) in &status.plugins {
        let state = match state {
            MonitorState::Monitoring => "monitoring".green(),
            MonitorState::Starting => "starting".yellow(),
            MonitorState::Stopped => "stopped".red(),
        };
        println!("Plugin {plugin}: {state}");
    }

    for pool in &status.pools {
        println!("{} ({:?})", pool.profile.bold(), pool.strategy);
        if pool.resources.is_empty() {
            println!("  no matching reader");
        }
        for resource in &pool.resources {
            let state = match resource.state {
                ResourceState::Free => "free".green(),
                ResourceState::Allocated => "allocated".yellow(),
                ResourceState::Removed => "removed".red(),
            };
            println!("  {} [{}] {}", resource.reader, resource.plugin, state);
        }
    }
    Ok(())
}

/// Allocate a resource, hold it for a while, then release it
pub(crate) fn allocate(
    service: &CardResourceService,
    profile: &str,
    wait_ms: Option<u64>,
    hold_ms: u64,
) -> eyre::Result<()> {
    let resource = match wait_ms {
        Some(wait) => service.allocate(profile, Duration::from_millis(wait))?,
        None => service.allocate_default(profile)?,
    };

    let Some(resource) = resource else {
        println!("No card resource available for profile {profile}");
        return Ok(());
    };

    println!("Allocated {}", resource.to_string().green());
    for (i, response) in resource.selection_responses().iter().enumerate() {
        println!("  selection {}: {}", i + 1, hex::encode_upper(response));
    }

    if hold_ms > 0 {
        debug!("Holding {} for {} ms", resource.reader(), hold_ms);
        thread::sleep(Duration::from_millis(hold_ms));
    }

    service.release(&resource)?;
    println!("Released {}", resource.reader());
    Ok(())
}

/// Print the pools each time they change, for `seconds`
pub(crate) fn watch(service: &CardResourceService, seconds: u64) -> eyre::Result<()> {
    let deadline = Instant::now() + Duration::from_secs(seconds);
    let mut last = None;

    while Instant::now() < deadline {
        let current = service.status()?;
        if last.as_ref() != Some(&current) {
            status(service)?;
            println!();
            last = Some(current);
        }
        thread::sleep(Duration::from_millis(250));
    }
    Ok(())
}
