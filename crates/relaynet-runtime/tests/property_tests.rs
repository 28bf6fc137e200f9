//! Property-based tests for poll group membership and message delivery
//!
//! These tests verify invariants that must hold for any sequence of
//! operations: a connection belongs to at most one poll group, reliable
//! traffic arrives complete and in order, and unreliable traffic never
//! arrives twice.

mod test_utils;

use std::collections::{BTreeMap, HashSet};

use proptest::prelude::*;
use relaynet_harness::{EndpointConfig, SimulatedNetwork};
use relaynet_runtime::{ConnectionHandle, DeliveryClass, Identity, PollGroupHandle, VirtualPort};
use test_utils::*;

const CONNECTIONS: usize = 4;
const GROUPS: usize = 3;

/// Assign to a group (`Some`) or leave the current one (`None`)
fn arb_membership_op() -> impl Strategy<Value = (usize, Option<usize>)> {
    (0..CONNECTIONS, prop::option::of(0..GROUPS))
}

/// Distinct payloads so each delivery can be traced back to its send
fn arb_payloads() -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(prop::collection::vec(any::<u8>(), 0..48), 1..40).prop_map(|bodies| {
        bodies
            .into_iter()
            .enumerate()
            .map(|(index, body)| {
                let mut tagged = (index as u16).to_be_bytes().to_vec();
                tagged.extend(body);
                tagged
            })
            .collect()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: every connection is in at most one poll group, and the
    /// provider agrees with the runtime about which one
    #[test]
    fn poll_group_membership_is_exclusive(
        ops in prop::collection::vec(arb_membership_op(), 1..40),
        destroy in prop::option::of(0..GROUPS),
    ) {
        let (provider, mut context) = standalone(EndpointConfig::new("hostA"));
        let connections: Vec<ConnectionHandle> = (0..CONNECTIONS)
            .map(|i| {
                context
                    .connect(&Identity::new(format!("peer{}", i)), VirtualPort::new(1))
                    .unwrap()
            })
            .collect();
        let groups: Vec<PollGroupHandle> = (0..GROUPS)
            .map(|_| context.create_poll_group().unwrap())
            .collect();
        let mut model: BTreeMap<usize, usize> = BTreeMap::new();

        for (connection, group) in ops {
            match group {
                Some(group) => {
                    context.assign_to_poll_group(connections[connection], groups[group]).unwrap();
                    model.insert(connection, group);
                }
                None => {
                    let left = context.unassign_from_poll_group(connections[connection]).unwrap();
                    prop_assert_eq!(left, model.remove(&connection).is_some());
                }
            }

            for (index, handle) in connections.iter().enumerate() {
                let containing = groups
                    .iter()
                    .filter(|group| context.poll_group_members(**group).unwrap().contains(handle))
                    .count();
                prop_assert!(containing <= 1);
                prop_assert_eq!(
                    provider.poll_group_of(*handle),
                    model.get(&index).map(|group| groups[*group])
                );
            }
        }

        if let Some(group) = destroy {
            let expected = model.values().filter(|member| **member == group).count();
            prop_assert_eq!(context.destroy_poll_group(groups[group]).unwrap(), expected);
            for handle in &connections {
                prop_assert_ne!(provider.poll_group_of(*handle), Some(groups[group]));
            }
            prop_assert!(context.poll_group_members(groups[group]).is_err());
        }
    }

    /// Property: reliable messages arrive exactly once and in send order,
    /// including messages queued before the connection was accepted
    #[test]
    fn reliable_delivery_preserves_order(
        payloads in arb_payloads(),
        queued in 0usize..10,
    ) {
        let network = SimulatedNetwork::new();
        let mut pair = pending_pair(&network, EndpointConfig::new(CLIENT));
        let queued = queued.min(payloads.len());

        for payload in &payloads[..queued] {
            pair.client.send(pair.outbound, payload, DeliveryClass::Reliable).unwrap();
        }
        pair.accept();
        for payload in &payloads[queued..] {
            pair.client.send(pair.outbound, payload, DeliveryClass::Reliable).unwrap();
        }

        let received = pair.server.receive_on_connection(pair.inbound, 256).unwrap();
        let bodies: Vec<Vec<u8>> = received.iter().map(|message| message.payload.clone()).collect();
        prop_assert_eq!(bodies, payloads);
        prop_assert!(received
            .windows(2)
            .all(|pair| pair[0].message_number < pair[1].message_number));
    }

    /// Property: without loss, unreliable delivery is a permutation of what was sent
    #[test]
    fn unreliable_delivery_is_a_permutation(
        payloads in arb_payloads(),
        seed in any::<u64>(),
    ) {
        let network = SimulatedNetwork::with_seed(seed);
        let mut pair = connected_pair(&network, EndpointConfig::new(CLIENT).with_reordering(0.0));

        for payload in &payloads {
            pair.client.send(pair.outbound, payload, DeliveryClass::Unreliable).unwrap();
        }

        let mut received: Vec<Vec<u8>> = pair
            .server
            .receive_on_connection(pair.inbound, 256)
            .unwrap()
            .into_iter()
            .map(|message| message.payload)
            .collect();
        let mut sent = payloads.clone();
        received.sort();
        sent.sort();
        prop_assert_eq!(received, sent);
    }

    /// Property: lossy unreliable delivery never duplicates or invents messages
    #[test]
    fn lossy_delivery_never_duplicates(
        payloads in arb_payloads(),
        seed in any::<u64>(),
    ) {
        let network = SimulatedNetwork::with_seed(seed);
        let mut pair = connected_pair(&network, EndpointConfig::lossy(CLIENT));

        for payload in &payloads {
            pair.client.send(pair.outbound, payload, DeliveryClass::Unreliable).unwrap();
        }

        let received = pair.server.receive_on_connection(pair.inbound, 256).unwrap();
        prop_assert!(received.len() <= payloads.len());
        let mut seen = HashSet::new();
        for message in &received {
            prop_assert!(payloads.contains(&message.payload));
            prop_assert!(seen.insert(message.payload.clone()));
        }
    }
}
