use stress_test::{stress_test_documents, stress_test_queue, stress_test_scaling};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// `OFFGRID_STRESS_SEED` pins the run; otherwise a fresh seed is drawn.
fn seed() -> u64 {
    std::env::var("OFFGRID_STRESS_SEED")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(rand::random)
}

#[tokio::main]
async fn main() {
    init_tracing();
    let seed = seed();

    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            OFFGRID STRESS TESTS                            ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    println!("Started {} with seed {}", chrono::Utc::now().to_rfc3339(), seed);

    let mut results = Vec::new();

    // Test 1: document convergence, small scale
    results.push(stress_test_documents(4, 200, seed).await);

    // Test 2: document convergence, medium scale
    results.push(stress_test_documents(10, 1000, seed).await);

    // Test 3: outbound queue against a flaky remote
    results.push(stress_test_queue(4, 250, 0.2, seed).await);

    for stats in &results {
        stats.print();
    }

    // Test 4: scaling analysis
    let scaling_passed = stress_test_scaling(20, 4, seed).await;

    if results.iter().all(|s| s.passed) && scaling_passed {
        println!("\n✓ All stress tests completed successfully!");
    } else {
        println!("\n✗ Stress tests failed (seed {})", seed);
        std::process::exit(1);
    }
}
