//! A toy recipe runner, to watch the admission core work on a live host.
//!
//! Spawns a handful of `sh` children that allocate nothing interesting,
//! asking the gate before each spawn and notifying it after each reap,
//! exactly the way a real recipe runner would.  Run it twice: the second
//! run starts warm from `.make_memory_cache`.
//!
//! ```text
//! cargo run --example toy_runner
//! ```

use std::process::Command;
use std::time::Duration;

use remake_memguard::{Admission, Config, MemGuard, default_probe};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Config::builder()
        .from_env()
        .build()
        .expect("default configuration is valid");
    let guard = MemGuard::new(config, default_probe());

    // Pretend each "recipe" compiles one well-known source file.
    let recipes = [
        "src/alpha.cpp",
        "src/beta.cpp",
        "src/gamma.cc",
        "lib/delta.c",
    ];

    for source in recipes {
        let argv = ["cc", "-c", source];

        // The gate says wait until the spawn fits; a real runner would
        // interleave other work here instead of sleeping.
        while guard.may_spawn(argv) == Admission::Wait {
            std::thread::sleep(Duration::from_millis(100));
        }

        let mut child = Command::new("sh")
            .arg("-c")
            // Hold a little memory for long enough for the monitor to see.
            .arg("x=$(head -c 2000000 /dev/zero | base64); sleep 1")
            // Positional args put the source path on the child's command
            // line, where the walker's classifier will find it.
            .arg("cc-shim")
            .arg(source)
            .spawn()
            .expect("spawn sh");
        println!("spawned {} for {source}", child.id());

        let _ = child.wait();
        guard.child_exited();
    }

    // Let the monitor catch the last exits, then tear down in order.
    std::thread::sleep(Duration::from_millis(500));
    guard.shutdown();
    println!("done; profiles are in .make_memory_cache");
}
