/*!
 * Policy Compiler Tests
 * Compiled artifacts are deterministic and malformed rules never compile
 */

use pretty_assertions::assert_eq;
use proptest::prelude::*;
use sandboxer::sandbox::backends::{
    compile_bwrap_args, compile_descriptor, compile_profile, compile_properties, Action,
    BubblewrapConfig, Filter, PolicyArg, PropertyRule, Scope, SeatbeltArg, SeatbeltRule,
    WindowsSandboxConfig,
};
use sandboxer::{CommandOptions, SandboxError};
use std::path::{Path, PathBuf};

fn scope_strategy() -> impl Strategy<Value = Scope> {
    prop_oneof![
        Just(Scope::Network),
        Just(Scope::FileWrite),
        Just(Scope::FileRead),
        Just(Scope::Process),
        Just(Scope::Default),
    ]
}

fn seatbelt_rule_strategy() -> impl Strategy<Value = SeatbeltRule> {
    (
        prop_oneof![Just(Action::Allow), Just(Action::Deny)],
        scope_strategy(),
        prop::collection::vec("/[a-z]{1,8}(/[a-z]{1,8}){0,2}", 0..3),
    )
        .prop_map(|(action, scope, paths)| SeatbeltRule {
            action,
            scope,
            args: paths
                .into_iter()
                .map(|p| SeatbeltArg::Subpath(PathBuf::from(p)))
                .collect(),
        })
}

fn property_rule_strategy() -> impl Strategy<Value = PropertyRule> {
    prop_oneof![
        prop_oneof![Just("yes"), Just("no"), Just("YES"), Just("No")].prop_map(|v| {
            PropertyRule::new(Filter::PrivateTmp, PolicyArg::Bool(v.to_string()))
        }),
        prop::collection::vec("[a-z]{1,6}", 1..4).prop_map(|caps| {
            PropertyRule::new(Filter::CapabilityBoundingSet, PolicyArg::Capabilities(caps))
        }),
        "[A-Za-z]{1,10}".prop_map(|name| {
            PropertyRule::new(Filter::Other(name), PolicyArg::Text("strict".to_string()))
        }),
    ]
}

proptest! {
    #[test]
    fn seatbelt_profile_is_deterministic(rules in prop::collection::vec(seatbelt_rule_strategy(), 0..8)) {
        let first = compile_profile(&rules).unwrap();
        let second = compile_profile(&rules).unwrap();
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(first.lines().count(), rules.len() + 2);
    }

    #[test]
    fn systemd_properties_are_deterministic(rules in prop::collection::vec(property_rule_strategy(), 0..8)) {
        let first = compile_properties(&rules).unwrap();
        let second = compile_properties(&rules).unwrap();
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(&first[..3], &["--pipe".to_string(), "--pty".to_string(), "--user".to_string()]);
    }

    #[test]
    fn systemd_bool_values_outside_yes_no_are_rejected(value in "[a-z]{1,6}") {
        prop_assume!(value != "yes" && value != "no");
        let rules = vec![PropertyRule::new(Filter::NoNewPrivileges, PolicyArg::Bool(value))];
        prop_assert!(matches!(compile_properties(&rules), Err(SandboxError::ConfigInvalid(_))));
    }

    #[test]
    fn bubblewrap_args_are_deterministic(
        env in prop::collection::btree_map("[A-Z]{1,6}", "[a-z0-9]{0,6}", 0..6),
        args in prop::collection::vec("[a-z]{1,6}", 0..4),
    ) {
        let config = BubblewrapConfig {
            environment: env,
            unshare_pid: true,
            ..BubblewrapConfig::default()
        };
        let options = CommandOptions::new("echo").with_args(args.clone());
        let first = compile_bwrap_args(&config, Path::new("/tmp/root"), &options);
        let second = compile_bwrap_args(&config, Path::new("/tmp/root"), &options);
        prop_assert_eq!(&first, &second);
        prop_assert!(first.ends_with(&args));
    }

    #[test]
    fn windows_descriptor_preserves_logon_order(commands in prop::collection::vec("[a-z]{3,10}\\.cmd", 1..6)) {
        let config = WindowsSandboxConfig {
            logon_commands: commands.clone(),
            ..WindowsSandboxConfig::default()
        };
        let xml = compile_descriptor(&config, Path::new("/shared"), &[]).unwrap();
        prop_assert_eq!(&xml, &compile_descriptor(&config, Path::new("/shared"), &[]).unwrap());

        let mut cursor = 0;
        for command in &commands {
            let tag = format!("<Command>{}</Command>", command);
            let found = xml[cursor..].find(&tag);
            prop_assert!(found.is_some(), "{} out of order in {}", command, xml);
            cursor += found.unwrap_or(0) + tag.len();
        }
    }
}

#[test]
fn seatbelt_string_with_quote_never_compiles() {
    for bad in ["a\"b", "line\nbreak"] {
        let rules = vec![SeatbeltRule::new(Action::Deny, Scope::FileRead)
            .with_arg(SeatbeltArg::Regex(bad.to_string()))];
        assert!(matches!(
            compile_profile(&rules),
            Err(SandboxError::ConfigInvalid(_))
        ));
    }
}

#[test]
fn systemd_filter_dedup_keeps_last() {
    let rules = vec![
        PropertyRule::new(Filter::ProtectHome, PolicyArg::Text("read-only".into())),
        PropertyRule::new(Filter::ProtectHome, PolicyArg::Text("tmpfs".into())),
    ];
    let args = compile_properties(&rules).unwrap();
    assert_eq!(
        args,
        vec![
            "--pipe".to_string(),
            "--pty".to_string(),
            "--user".to_string(),
            "-p".to_string(),
            "ProtectHome=tmpfs".to_string(),
        ]
    );
}

#[test]
fn windows_firewall_and_host_ips_follow_user_entries() {
    let config = WindowsSandboxConfig {
        logon_commands: vec!["setup.cmd".into()],
        ips: vec!["10.1.1.1".into()],
        disable_firewall: true,
        ..WindowsSandboxConfig::default()
    };
    let xml = compile_descriptor(&config, Path::new("/shared"), &["127.0.0.1".into()]).unwrap();
    let setup = xml.find("setup.cmd").unwrap();
    let firewall = xml.find("netsh advfirewall set allprofiles state off").unwrap();
    assert!(setup < firewall);
    assert!(xml.find("10.1.1.1").unwrap() < xml.find("127.0.0.1").unwrap());
}
