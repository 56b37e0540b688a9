//! libp2p behaviour for the peer router.

use std::num::NonZeroUsize;
use std::time::Duration;

use libp2p::kad::store::{MemoryStore, MemoryStoreConfig};
use libp2p::swarm::NetworkBehaviour;
use libp2p::{identify, kad, PeerId, StreamProtocol};

use crate::routing::KEY_TTL;

/// Kademlia protocol name, namespaced so the overlay cannot collide with
/// unrelated DHTs on the same transport.
pub const KAD_PROTOCOL: StreamProtocol = StreamProtocol::new("/spegel/kad/1.0.0");

/// Identify protocol version string.
const IDENTIFY_PROTOCOL: &str = "/spegel/id/1.0.0";

/// Combined behaviour: Kademlia for provider records, identify to learn
/// peer listen addresses for the resolver's address book.
#[derive(NetworkBehaviour)]
pub struct RouterBehaviour {
    pub kademlia: kad::Behaviour<MemoryStore>,
    pub identify: identify::Behaviour,
}

impl RouterBehaviour {
    pub fn new(keypair: &libp2p::identity::Keypair) -> Self {
        let local_peer_id = PeerId::from(keypair.public());

        let mut kad_config = kad::Config::new(KAD_PROTOCOL);
        kad_config.set_provider_record_ttl(Some(KEY_TTL));
        kad_config.set_record_ttl(Some(KEY_TTL));
        kad_config.set_query_timeout(Duration::from_secs(10));
        kad_config.set_replication_factor(
            NonZeroUsize::new(3).expect("replication factor is non-zero"),
        );

        // Only provider records are stored; the advertised set of a node can
        // easily exceed the default provided-key cap.
        let store = MemoryStore::with_config(
            local_peer_id,
            MemoryStoreConfig {
                max_provided_keys: 1024 * 1024,
                max_providers_per_key: 256,
                ..Default::default()
            },
        );

        let mut kademlia = kad::Behaviour::with_config(local_peer_id, store, kad_config);
        kademlia.set_mode(Some(kad::Mode::Server));

        let identify = identify::Behaviour::new(identify::Config::new(
            IDENTIFY_PROTOCOL.to_owned(),
            keypair.public(),
        ));

        Self { kademlia, identify }
    }
}
