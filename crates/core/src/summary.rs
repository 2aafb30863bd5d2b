//! Short status strings for listing entities (CLI tables, logs).

use crate::{Entity, Shape};

/// One-word status for an entity, `-` when the type has none.
pub fn status_of(entity: &Entity) -> String {
    match entity.shape() {
        Shape::VirtualMachine(vm) => vm.status.printable_status.clone().unwrap_or_else(|| "Unknown".into()),
        Shape::VirtualMachineInstance(vmi) => vmi.status.phase.clone().unwrap_or_else(|| "Pending".into()),
        Shape::DataVolume(dv) => match (&dv.status.phase, &dv.status.progress) {
            (Some(p), Some(pr)) if p != "Succeeded" && pr != "N/A" => format!("{} ({})", p, pr),
            (Some(p), _) => p.clone(),
            (None, _) => "Unknown".into(),
        },
        Shape::Node(node) => {
            if node.status.conditions.iter().any(|c| c.kind == "Ready") {
                if node.is_ready() { "Ready".into() } else { "NotReady".into() }
            } else {
                "Unknown".into()
            }
        }
        Shape::Generic { .. } => entity
            .raw()
            .pointer("/status/phase")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".into()),
    }
}

/// Age column in kubectl style (`45s`, `12m`, `3h`, `5d`).
pub fn render_age(creation_ts: i64, now_ts: i64) -> String {
    if creation_ts <= 0 { return "-".into(); }
    let secs = (now_ts - creation_ts).max(0);
    match secs {
        s if s < 60 => format!("{}s", s),
        s if s < 3600 => format!("{}m", s / 60),
        s if s < 86_400 => format!("{}h", s / 3600),
        s => format!("{}d", s / 86_400),
    }
}
