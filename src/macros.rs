//! `metrics_update!` is the teacher's macro from
//! `actors::prometheus_exporter` verbatim in shape, repointed at this
//! crate's metric statics. `retry_with_backoff!` generalizes the teacher's
//! `repeat_until_ok!` (`storages::mod`): that macro retries forever on a
//! fixed sleep, which is right for a loader that has nowhere else to go:
//! here most callers (ledger CAS, round completion) must eventually give up
//! and report `RetryExhausted`/`NoRoundsLeft` rather than loop forever, so
//! this version is attempt-bounded with linearly growing backoff.

#[macro_export]
macro_rules! metrics_update {
    ( inc $metric:ident ) => {
        $crate::metrics::$metric.inc();
    };

    ( inc $metric:ident, $labels:expr ) => {
        $crate::metrics::$metric.with_label_values($labels).inc();
    };

    ( dec $metric:ident ) => {
        $crate::metrics::$metric.dec();
    };

    ( dec $metric:ident, $labels:expr ) => {
        $crate::metrics::$metric.with_label_values($labels).dec();
    };

    ( set $metric:ident, $value:expr ) => {
        $crate::metrics::$metric.set($value);
    };

    ( set $metric:ident, $labels:expr, $value:expr ) => {
        $crate::metrics::$metric.with_label_values($labels).set($value);
    };

    ( timer $metric:ident ) => {
        $crate::metrics::$metric.start_timer()
    };

    ( timer observe $timer:expr ) => {
        $timer.observe_duration();
    };
}

#[macro_export]
macro_rules! retry_with_backoff {
    ( $func:expr, $max_attempts:expr, $base_delay_ms:expr ) => {{
        let mut attempt: u32 = 0;
        loop {
            match $func {
                Ok(result) => break Ok(result),
                Err(err) if attempt + 1 >= $max_attempts => break Err(err),
                Err(err) => {
                    log::warn!(
                        "attempt {}/{} failed for {}: {}",
                        attempt + 1,
                        $max_attempts,
                        stringify!($func),
                        err
                    );
                    attempt += 1;
                    tokio::time::sleep(std::time::Duration::from_millis(
                        $base_delay_ms * attempt as u64,
                    ))
                    .await;
                }
            }
        }
    }};
}
