#![no_main]

use std::time::Duration;

use adw_retry::{RetryStrategyConfig, RetryStrategyType, calculate_delay};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (u32, u8, u64, u64, u8)| {
    let (attempt, strategy_byte, base_ms, max_ms, jitter_byte) = data;

    let attempt = attempt % 200 + 1; // 1-200
    let strategy = match strategy_byte % 4 {
        0 => RetryStrategyType::Immediate,
        1 => RetryStrategyType::Exponential,
        2 => RetryStrategyType::Linear,
        _ => RetryStrategyType::Constant,
    };
    let base_delay = Duration::from_millis(base_ms % 10_000 + 1);
    let max_delay = Duration::from_millis(max_ms % 300_000 + 100);
    let jitter = (jitter_byte as f64) / 255.0;

    let config = RetryStrategyConfig {
        strategy,
        max_attempts: 100,
        base_delay,
        max_delay,
        jitter,
    };

    let delay = calculate_delay(&config, attempt);

    // The delay cap holds regardless of strategy or jitter.
    assert!(delay <= max_delay);

    if strategy == RetryStrategyType::Immediate {
        assert_eq!(delay, Duration::ZERO);
    }

    if strategy == RetryStrategyType::Constant && jitter == 0.0 {
        assert_eq!(delay, base_delay.min(max_delay));
    }
});
