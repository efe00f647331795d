use eonix_mm::address::PRange;
use eonix_sync::Spin;

use crate::page::MigrateType;
use crate::zone::{Watermark, Zone, ZoneKind};

pub const MAX_NODES: usize = 8;

/// SLIT-style NUMA distance, `10` local / `20` remote by default (see
/// DESIGN.md's Open Question decision), `255` for nodes never reported
/// present by the boot topology.
pub const DISTANCE_UNKNOWN: u8 = 255;
pub const DISTANCE_LOCAL: u8 = 10;
pub const DISTANCE_REMOTE_DEFAULT: u8 = 20;

/// One NUMA node: its DMA/DMA32/Normal zones and its row of the
/// node-to-node distance matrix.
pub struct Node {
    present: bool,
    zones: [Option<Spin<Zone>>; ZoneKind::COUNT],
    distance: [u8; MAX_NODES],
}

impl Node {
    pub const fn absent() -> Self {
        Self {
            present: false,
            zones: [None, None, None],
            distance: [DISTANCE_UNKNOWN; MAX_NODES],
        }
    }

    pub fn is_present(&self) -> bool {
        self.present
    }

    pub fn distance_to(&self, other: u8) -> u8 {
        self.distance[other as usize]
    }

    pub fn zone(&self, kind: ZoneKind) -> Option<&Spin<Zone>> {
        self.zones[kind.index()].as_ref()
    }

    pub fn zones(&self) -> impl Iterator<Item = &Spin<Zone>> {
        self.zones.iter().filter_map(|z| z.as_ref())
    }

    pub fn free_pages_count(&self) -> usize {
        self.zones().map(|z| z.lock().free_pages_count()).sum()
    }

    pub fn above_watermark_any(&self) -> bool {
        self.zones().any(|z| z.lock().above_watermark(Watermark::Low))
    }
}

pub struct NodeBuilder {
    node_id: u8,
    zones: [Option<Zone>; ZoneKind::COUNT],
}

impl NodeBuilder {
    pub fn new(node_id: u8) -> Self {
        Self {
            node_id,
            zones: [None, None, None],
        }
    }

    /// Register one zone's physical range for this node and seed its free
    /// lists, biasing the initial migrate type toward `Movable` (user
    /// pages dominate total memory, so most boot-time free blocks should
    /// start out movable; long-lived kernel allocations pull from it via
    /// the fallback chain until compaction/anti-fragmentation matters).
    pub fn add_zone(&mut self, kind: ZoneKind, range: PRange) -> &mut Self {
        let mut zone = Zone::new(kind, self.node_id, range);
        zone.create_pages(range.start(), range.end(), MigrateType::Movable);
        self.zones[kind.index()] = Some(zone);
        self
    }

    pub fn build(self) -> Node {
        let mut distance = [DISTANCE_UNKNOWN; MAX_NODES];
        distance[self.node_id as usize] = 0;

        Node {
            present: true,
            zones: self.zones.map(|z| z.map(Spin::new)),
            distance,
        }
    }
}

/// Sets `distance[a][b] = distance[b][a] = dist` across a node table built
/// from SLIT data; nodes otherwise default to [`DISTANCE_REMOTE_DEFAULT`]
/// once both are marked present (see [`finalize_distances`]).
pub fn set_distance(nodes: &mut [Node; MAX_NODES], a: u8, b: u8, dist: u8) {
    nodes[a as usize].distance[b as usize] = dist;
    nodes[b as usize].distance[a as usize] = dist;
}

/// Fill in any present-node pair that wasn't given an explicit SLIT
/// distance with the default remote distance, and self-distance with 0.
pub fn finalize_distances(nodes: &mut [Node; MAX_NODES]) {
    for i in 0..MAX_NODES {
        if !nodes[i].present {
            continue;
        }
        nodes[i].distance[i] = 0;
        for j in 0..MAX_NODES {
            if i == j || !nodes[j].present {
                continue;
            }
            if nodes[i].distance[j] == DISTANCE_UNKNOWN {
                nodes[i].distance[j] = DISTANCE_REMOTE_DEFAULT;
            }
        }
    }
}

/// Returns present node ids ordered by NUMA distance from `from`, nearest
/// first, ties broken by node id. Used by the PCP refill path and SLUB's
/// partial-list search to prefer local memory without hard-failing when
/// the local node is empty.
pub fn nodes_by_distance(nodes: &[Node; MAX_NODES], from: u8) -> [u8; MAX_NODES] {
    let mut order: [u8; MAX_NODES] = core::array::from_fn(|i| i as u8);
    order.sort_by_key(|&n| {
        if nodes[n as usize].present {
            (nodes[from as usize].distance_to(n), n)
        } else {
            (DISTANCE_UNKNOWN, n)
        }
    });
    order
}
