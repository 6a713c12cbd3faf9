#[cfg(test)]
mod tests_impl {
    use crate::core::conflict::detect_conflict;
    use crate::core::lifecycle::{LifecycleEvent, Step, advance};
    use crate::core::rule::RuleState;
    use crate::core::test_helpers::{RuleBuilder, rule_on};

    #[test]
    fn test_rule_flows_through_every_state() {
        let mut rule = rule_on(1).ports(443, 443).build();
        let existing = vec![rule.clone()];
        detect_conflict(&rule, &existing).unwrap();

        let mut seen = vec![rule.state];
        for event in [
            LifecycleEvent::ConflictCheckPassed,
            LifecycleEvent::Applied,
            LifecycleEvent::Applied,
            LifecycleEvent::RevokeRequested,
            LifecycleEvent::RevokeRequested,
        ] {
            advance(&mut rule, event).unwrap();
            seen.push(rule.state);
        }
        assert_eq!(
            seen,
            vec![
                RuleState::Staged,
                RuleState::Add,
                RuleState::Active,
                RuleState::Active,
                RuleState::Revoke,
                RuleState::Revoke,
            ]
        );
        assert_eq!(
            advance(&mut rule, LifecycleEvent::Applied).unwrap(),
            Step::Delete
        );
    }

    #[test]
    fn test_revoked_rule_frees_its_ports() {
        let old = rule_on(1).ports(80, 80).state(RuleState::Revoke).build();
        let new = RuleBuilder::forwarding(1).ports(80, 80).vm(5).build();
        let existing = vec![old, new.clone()];
        assert!(detect_conflict(&new, &existing).is_ok());
    }
}

#[cfg(test)]
mod property_tests {
    use crate::core::conflict::detect_conflict;
    use crate::core::lifecycle::{LifecycleEvent, Step, next};
    use crate::core::rule::{PortRange, Protocol, Purpose, Rule, RuleState};
    use crate::core::rule_constraints::{nat_modes_differ, overlap_exempt};
    use crate::core::test_helpers::rule_on;
    use proptest::prelude::*;

    prop_compose! {
        fn arb_port()(port in 1u16..=2000) -> u16 {
            port
        }
    }

    prop_compose! {
        fn arb_port_range()(start in arb_port(), end in arb_port()) -> PortRange {
            PortRange::new(start.min(end), start.max(end))
        }
    }

    prop_compose! {
        fn arb_rule()(
            range in arb_port_range(),
            protocol in prop_oneof![Just("tcp"), Just("udp"), Just("TCP")],
            purpose in prop_oneof![
                Just(Purpose::Firewall),
                Just(Purpose::PortForwarding),
                Just(Purpose::StaticNat),
            ],
            network in 1u64..=2,
            nat in any::<bool>(),
        ) -> Rule {
            let mut builder = rule_on(1)
                .purpose(purpose)
                .ports(range.start, range.end)
                .protocol(protocol)
                .network(network);
            if nat {
                builder = builder.nat();
            }
            builder.build()
        }
    }

    fn arb_event() -> impl Strategy<Value = LifecycleEvent> {
        prop_oneof![
            Just(LifecycleEvent::ConflictCheckPassed),
            Just(LifecycleEvent::ConflictCheckFailed),
            Just(LifecycleEvent::RevokeRequested),
            Just(LifecycleEvent::Applied),
        ]
    }

    fn may_coexist(a: &Rule, b: &Rule) -> bool {
        !nat_modes_differ(a, b)
            && a.network == b.network
            && (!a.source_ports.overlaps(&b.source_ports)
                || overlap_exempt((a.purpose(), &a.protocol), (b.purpose(), &b.protocol)))
    }

    proptest! {
        #[test]
        fn test_overlap_matches_port_membership(a in arb_port_range(), b in arb_port_range()) {
            let shared = (a.start..=a.end).any(|p| b.contains(p));
            prop_assert_eq!(a.overlaps(&b), shared);
            prop_assert_eq!(a.overlaps(&b), b.overlaps(&a));
        }

        #[test]
        fn test_conflict_detection_is_symmetric(a in arb_rule(), b in arb_rule()) {
            let ab = detect_conflict(&b, &[a.clone(), b.clone()]).is_err();
            let ba = detect_conflict(&a, &[a.clone(), b.clone()]).is_err();
            prop_assert_eq!(ab, ba);
            prop_assert_eq!(ab, !may_coexist(&a, &b));
        }

        #[test]
        fn test_admitted_rules_satisfy_address_invariants(
            candidates in prop::collection::vec(arb_rule(), 1..24)
        ) {
            let mut admitted: Vec<Rule> = Vec::new();
            for candidate in candidates {
                let mut existing = admitted.clone();
                existing.push(candidate.clone());
                if detect_conflict(&candidate, &existing).is_ok() {
                    admitted.push(candidate);
                }
            }

            for (i, a) in admitted.iter().enumerate() {
                for b in &admitted[i + 1..] {
                    prop_assert!(may_coexist(a, b), "{} and {} coexist", a, b);
                }
            }
            let nat = admitted.iter().filter(|r| r.one_to_one_nat).count();
            prop_assert!(nat == 0 || nat == admitted.len());
        }

        #[test]
        fn test_lifecycle_never_returns_to_staged(
            events in prop::collection::vec(arb_event(), 0..16)
        ) {
            let mut state = RuleState::Staged;
            for event in events {
                match next(state, event) {
                    Ok(Step::Transition(new_state)) => {
                        prop_assert_ne!(new_state, RuleState::Staged);
                        state = new_state;
                    }
                    Ok(Step::Delete) => break,
                    Ok(Step::Unchanged) => {}
                    Err(_) => {
                        let legal_for_staged = state == RuleState::Staged
                            && event != LifecycleEvent::Applied;
                        prop_assert!(!legal_for_staged);
                    }
                }
            }
        }

        #[test]
        fn test_protocol_normalization_is_idempotent(name in "[a-zA-Z]{1,8}") {
            let once = Protocol::new(&name);
            prop_assert_eq!(Protocol::new(once.as_str()), once.clone());
            prop_assert_eq!(once.as_str(), name.to_ascii_lowercase());
        }
    }
}
