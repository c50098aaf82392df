use sandbox::{InstanceSpec, SecurityPolicy};

/// `docker run` isolation flags for `policy`.
pub(crate) fn policy_args(policy: &SecurityPolicy) -> Vec<String> {
    let mut args = Vec::with_capacity(8);
    if policy.network_disabled {
        args.push("--network=none".to_string());
    }
    args.push(format!("--pids-limit={}", policy.limits.pids));
    args.push(format!("--memory={}m", policy.limits.memory_mb));
    args.push(format!("--cpus={}", policy.limits.cpus));
    if policy.drop_all_capabilities {
        args.push("--cap-drop=ALL".to_string());
    }
    if policy.no_new_privileges {
        args.push("--security-opt=no-new-privileges".to_string());
    }
    if policy.read_only_rootfs {
        // Runners stage and build under /tmp, so it stays writable.
        args.push("--read-only".to_string());
        args.push("--tmpfs=/tmp:rw,exec,size=64m".to_string());
    }
    args
}

/// Full argument list for `docker run` (without the binary itself).
///
/// `-i` keeps stdin open so keep-alive commands that read stdin never exit.
pub(crate) fn run_args(spec: &InstanceSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "-i".to_string(),
        "--label".to_string(),
        spec.label.to_string(),
    ];
    args.extend(policy_args(&spec.policy));
    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}
