/// Spin-controller and stranding-recovery knobs, injected once at registry
/// construction.
///
/// The defaults match the tuning the adaptive controller was derived with:
/// duration capped at `spin_limit`, successful spins rewarded by
/// `spin_bonus` (after being pulled up to `spin_poverty` so transient
/// failures cannot pin the duration at zero), failed spins penalized by
/// `spin_penalty`. `pre_spin` is the short unconditional try-lock burst and
/// `fixed_spin` replaces the adaptive policy wholesale when positive.
#[derive(Clone, Copy, Debug)]
pub struct MonitorTunables {
    pub spin_limit: i32,
    pub spin_bonus: i32,
    pub spin_penalty: i32,
    pub spin_poverty: i32,
    pub pre_spin: i32,
    pub fixed_spin: i32,
    /// Upper bound for the responsible thread's timed-park backoff.
    pub max_recheck_interval_ms: u64,
}

impl Default for MonitorTunables {
    fn default() -> Self {
        Self {
            spin_limit: 5000,
            spin_bonus: 100,
            spin_penalty: 200,
            spin_poverty: 1000,
            pre_spin: 10,
            fixed_spin: 0,
            max_recheck_interval_ms: 1000,
        }
    }
}

impl MonitorTunables {
    /// On a single processor spinning can never overlap the owner's
    /// critical section, so disable it entirely.
    pub fn single_processor() -> Self {
        Self {
            spin_limit: 0,
            pre_spin: 0,
            fixed_spin: -1,
            ..Self::default()
        }
    }
}
