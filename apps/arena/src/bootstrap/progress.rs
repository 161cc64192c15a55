use super::BootstrapPhase;

const CAP_BEFORE_META: u8 = 92;
const CAP_AFTER_META: u8 = 98;

fn phase_percent(phase: BootstrapPhase, meta_loaded: bool) -> Option<u8> {
    let percent = match phase {
        BootstrapPhase::CheckingProgress => 5,
        BootstrapPhase::StartingProject => 12,
        BootstrapPhase::WaitingActive => 25,
        BootstrapPhase::FsConnecting => 45,
        BootstrapPhase::FsMetaLoading if meta_loaded => 65,
        BootstrapPhase::FsMetaLoading => 55,
        BootstrapPhase::Ready => 80,
        BootstrapPhase::PtyConnecting => 90,
        BootstrapPhase::FullReady => 100,
        BootstrapPhase::Error => return None,
    };
    Some(percent)
}

/// Next progress value. Never lower than `previous`, frozen on `error`, and
/// 100 only on the final phase once metadata has loaded.
pub fn estimate(previous: u8, phase: BootstrapPhase, meta_loaded: bool, requires_pty: bool) -> u8 {
    let Some(target) = phase_percent(phase, meta_loaded) else {
        return previous;
    };
    let final_phase = match phase {
        BootstrapPhase::FullReady => true,
        BootstrapPhase::Ready => !requires_pty,
        _ => false,
    };
    let target = if final_phase && meta_loaded {
        100
    } else if meta_loaded {
        target.min(CAP_AFTER_META)
    } else {
        target.min(CAP_BEFORE_META)
    };
    previous.max(target)
}
