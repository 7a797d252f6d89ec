//! The RIP distance-vector routing engine run by a
//! [`RouterKernel`](crate::RouterKernel).
//!
//! Routers periodically advertise every `(destination, cost)` pair they know
//! on each of their interfaces. Neighbors integrate those advertisements into
//! their own [`RoutingTable`], adding the cost of the link the advertisement
//! arrived on. Leaf hosts answer advertisements with a
//! ["not a router"](RipDatagram::not_a_router) datagram, which the router
//! turns into a directly attached route to the host.

use crate::{message::Datum, Address, FxDashMap};
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Display, Formatter},
    time::{Duration, Instant},
};

/// The cost of an unreachable destination. Costs saturate here.
pub const INFINITY: u8 = 16;

/// One `(destination, cost)` pair in a [`RipDatagram`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RipEntry {
    pub destination: Address,
    pub cost: u8,
}

impl RipEntry {
    pub const fn new(destination: Address, cost: u8) -> Self {
        Self { destination, cost }
    }
}

impl Display for RipEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x} metric {}", self.destination, self.cost)
    }
}

/// A routing advertisement, or the answer of a host that is not a router.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RipDatagram {
    entries: Option<Vec<RipEntry>>,
}

impl RipDatagram {
    /// An advertisement listing the given entries.
    pub fn router(entries: Vec<RipEntry>) -> Self {
        Self {
            entries: Some(entries),
        }
    }

    /// The answer of a leaf host to an advertisement.
    pub fn not_a_router() -> Self {
        Self { entries: None }
    }

    /// The advertised entries. Routers always advertise at least themselves,
    /// so an absent or empty list both mean the sender is not a router.
    pub fn entries(&self) -> Option<&[RipEntry]> {
        self.entries.as_deref().filter(|entries| !entries.is_empty())
    }

    pub fn is_from_router(&self) -> bool {
        self.entries().is_some()
    }
}

impl Datum for RipDatagram {
    const TAG: &'static str = "rip::Datagram";
}

impl Display for RipDatagram {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.entries() {
            Some(entries) => {
                f.write_str("RIP [")?;
                for (i, entry) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    entry.fmt(f)?;
                }
                f.write_str("]")
            }
            None => f.write_str("RIP (not a router)"),
        }
    }
}

/// A route to one destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingEntry {
    pub destination: Address,
    pub cost: u8,
    /// The index of the interface to forward on
    pub next_hop: usize,
    /// When the route was last learned or refreshed
    pub refreshed: Instant,
}

impl RoutingEntry {
    /// Whether the destination can be reached at all.
    pub fn is_reachable(&self) -> bool {
        self.cost < INFINITY
    }
}

/// The distance-vector table of one router.
///
/// The table is a concurrent map so that advertising never blocks
/// integration. It is owned by exactly one router and never shared across
/// nodes.
pub struct RoutingTable {
    address: Address,
    link_cost: u8,
    routes: FxDashMap<Address, RoutingEntry>,
}

impl RoutingTable {
    /// Creates an empty table for the router at `address`.
    pub fn new(address: Address, link_cost: u8) -> Self {
        Self {
            address,
            link_cost,
            routes: Default::default(),
        }
    }

    /// The address of the router owning the table.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Integrates a datagram received from `source` over the interface at
    /// index `via`. Returns the number of routes that changed.
    ///
    /// A datagram without entries is a leaf host announcing itself; the host
    /// becomes a directly attached route at cost 0. Entries of a router
    /// datagram cost `link_cost` more than advertised. A route is added when
    /// the destination is unknown, and replaced when the new cost is strictly
    /// lower or when it was learned over the same interface, so a neighbor
    /// stays authoritative for the routes it gave us even when they get
    /// worse.
    pub fn integrate(
        &self,
        via: usize,
        source: Address,
        datagram: &RipDatagram,
        now: Instant,
    ) -> usize {
        let Some(entries) = datagram.entries() else {
            return usize::from(self.offer(source, 0, via, now));
        };
        let mut changed = 0;
        for entry in entries {
            let cost = entry.cost.saturating_add(self.link_cost).min(INFINITY);
            if self.offer(entry.destination, cost, via, now) {
                changed += 1;
            }
        }
        changed
    }

    /// Offers a route to the table. Returns whether the `(cost, next_hop)`
    /// of the destination changed.
    fn offer(&self, destination: Address, cost: u8, via: usize, now: Instant) -> bool {
        if destination == self.address || destination <= 0 {
            return false;
        }
        let candidate = RoutingEntry {
            destination,
            cost,
            next_hop: via,
            refreshed: now,
        };
        match self.routes.entry(destination) {
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(candidate);
                true
            }
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                let current = *entry.get();
                if cost < current.cost || current.next_hop == via {
                    entry.insert(candidate);
                    current.cost != cost || current.next_hop != via
                } else {
                    false
                }
            }
        }
    }

    /// The datagram to advertise: this router at cost 0 followed by every
    /// known route.
    pub fn advertisement(&self) -> RipDatagram {
        let mut entries = vec![RipEntry::new(self.address, 0)];
        entries.extend(
            self.snapshot()
                .into_iter()
                .map(|route| RipEntry::new(route.destination, route.cost)),
        );
        RipDatagram::router(entries)
    }

    /// Looks up the route to `destination`, if it is reachable.
    pub fn route(&self, destination: Address) -> Option<RoutingEntry> {
        self.routes
            .get(&destination)
            .map(|entry| *entry)
            .filter(RoutingEntry::is_reachable)
    }

    /// All routes, sorted by destination.
    pub fn snapshot(&self) -> Vec<RoutingEntry> {
        let mut routes: Vec<_> = self.routes.iter().map(|entry| *entry).collect();
        routes.sort_by_key(|route| route.destination);
        routes
    }

    /// Drops every route through the interface at index `via`. Returns the
    /// number of routes dropped.
    pub fn forget_interface(&self, via: usize) -> usize {
        let before = self.routes.len();
        self.routes.retain(|_, route| route.next_hop != via);
        before.saturating_sub(self.routes.len())
    }

    /// Drops every route that has not been refreshed within `timeout`.
    /// Returns the number of routes dropped.
    pub fn expire(&self, now: Instant, timeout: Duration) -> usize {
        let before = self.routes.len();
        self.routes
            .retain(|_, route| now.saturating_duration_since(route.refreshed) <= timeout);
        before.saturating_sub(self.routes.len())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn costs(table: &RoutingTable) -> Vec<(Address, u8, usize)> {
        table
            .snapshot()
            .into_iter()
            .map(|route| (route.destination, route.cost, route.next_hop))
            .collect()
    }

    #[test]
    fn leaf_answer_is_directly_attached() {
        let table = RoutingTable::new(1, 1);
        let changed = table.integrate(0, 10, &RipDatagram::not_a_router(), Instant::now());
        assert_eq!(changed, 1);
        assert_eq!(costs(&table), vec![(10, 0, 0)]);
    }

    #[test]
    fn router_entries_cost_one_more_link() {
        let table = RoutingTable::new(1, 1);
        let datagram = RipDatagram::router(vec![
            RipEntry::new(2, 0),
            RipEntry::new(20, 0),
            RipEntry::new(30, 1),
        ]);
        assert_eq!(table.integrate(3, 2, &datagram, Instant::now()), 3);
        assert_eq!(costs(&table), vec![(2, 1, 3), (20, 1, 3), (30, 2, 3)]);
    }

    #[test]
    fn own_address_is_ignored() {
        let table = RoutingTable::new(1, 1);
        let datagram = RipDatagram::router(vec![RipEntry::new(2, 0), RipEntry::new(1, 1)]);
        table.integrate(0, 2, &datagram, Instant::now());
        assert_eq!(costs(&table), vec![(2, 1, 0)]);
    }

    #[test]
    fn cheaper_route_replaces() {
        let table = RoutingTable::new(1, 1);
        let now = Instant::now();
        table.integrate(0, 2, &RipDatagram::router(vec![RipEntry::new(9, 4)]), now);
        table.integrate(1, 3, &RipDatagram::router(vec![RipEntry::new(9, 1)]), now);
        assert_eq!(costs(&table), vec![(9, 2, 1)]);
    }

    #[test]
    fn equal_cost_on_another_interface_does_not_replace() {
        let table = RoutingTable::new(1, 1);
        let now = Instant::now();
        table.integrate(0, 2, &RipDatagram::router(vec![RipEntry::new(9, 1)]), now);
        let changed =
            table.integrate(1, 3, &RipDatagram::router(vec![RipEntry::new(9, 1)]), now);
        assert_eq!(changed, 0);
        assert_eq!(costs(&table), vec![(9, 2, 0)]);
    }

    #[test]
    fn same_interface_is_authoritative_even_when_worse() {
        let table = RoutingTable::new(1, 1);
        let now = Instant::now();
        table.integrate(0, 2, &RipDatagram::router(vec![RipEntry::new(9, 1)]), now);
        let changed =
            table.integrate(0, 2, &RipDatagram::router(vec![RipEntry::new(9, 5)]), now);
        assert_eq!(changed, 1);
        assert_eq!(costs(&table), vec![(9, 6, 0)]);
    }

    #[test]
    fn costs_saturate_at_infinity() {
        let table = RoutingTable::new(1, 1);
        let now = Instant::now();
        table.integrate(0, 2, &RipDatagram::router(vec![RipEntry::new(9, INFINITY)]), now);
        table.integrate(0, 2, &RipDatagram::router(vec![RipEntry::new(8, 255)]), now);
        assert_eq!(costs(&table), vec![(8, INFINITY, 0), (9, INFINITY, 0)]);
        assert!(table.route(9).is_none());
    }

    #[test]
    fn advertisement_lists_self_first() {
        let table = RoutingTable::new(7, 1);
        table.integrate(0, 10, &RipDatagram::not_a_router(), Instant::now());
        let advertisement = table.advertisement();
        assert_eq!(
            advertisement.entries().unwrap(),
            &[RipEntry::new(7, 0), RipEntry::new(10, 0)]
        );
        assert!(advertisement.is_from_router());
    }

    #[test]
    fn empty_entry_list_means_not_a_router() {
        assert!(!RipDatagram::router(vec![]).is_from_router());
        assert!(!RipDatagram::not_a_router().is_from_router());
    }

    /// Drives three routers in a line (each with one leaf) through a few
    /// synchronous advertise/integrate rounds.
    ///
    /// ```text
    /// L10 -0- R1 -1- R2 -1- R3 -0- L30
    ///                 |
    ///                L20
    /// ```
    fn line() -> [RoutingTable; 3] {
        let routers = [
            RoutingTable::new(1, 1),
            RoutingTable::new(2, 1),
            RoutingTable::new(3, 1),
        ];
        let now = Instant::now();
        // Interface 0 of every router faces its leaf
        routers[0].integrate(0, 10, &RipDatagram::not_a_router(), now);
        routers[1].integrate(0, 20, &RipDatagram::not_a_router(), now);
        routers[2].integrate(0, 30, &RipDatagram::not_a_router(), now);
        routers
    }

    /// One round: every router integrates the advertisement of its
    /// neighbors. R1's interface 1 faces R2; R2's interface 1 faces R1 and 2
    /// faces R3; R3's interface 1 faces R2.
    fn round(routers: &[RoutingTable; 3]) -> usize {
        let now = Instant::now();
        let ads: Vec<_> = routers.iter().map(RoutingTable::advertisement).collect();
        routers[0].integrate(1, 2, &ads[1], now)
            + routers[1].integrate(1, 1, &ads[0], now)
            + routers[1].integrate(2, 3, &ads[2], now)
            + routers[2].integrate(1, 2, &ads[1], now)
    }

    #[test]
    fn line_converges() {
        let routers = line();
        for _ in 0..3 {
            round(&routers);
        }
        assert_eq!(
            costs(&routers[0]),
            vec![(2, 1, 1), (3, 2, 1), (10, 0, 0), (20, 1, 1), (30, 2, 1)]
        );
        assert_eq!(
            costs(&routers[1]),
            vec![(1, 1, 1), (3, 1, 2), (10, 1, 1), (20, 0, 0), (30, 1, 2)]
        );
        assert_eq!(
            costs(&routers[2]),
            vec![(1, 2, 1), (2, 1, 1), (10, 2, 1), (20, 1, 1), (30, 0, 0)]
        );
    }

    #[test]
    fn converged_line_is_a_fixed_point() {
        let routers = line();
        for _ in 0..3 {
            round(&routers);
        }
        let before: Vec<_> = routers.iter().map(costs).collect();
        for _ in 0..5 {
            assert_eq!(round(&routers), 0);
        }
        let after: Vec<_> = routers.iter().map(costs).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn forgetting_an_interface_drops_its_routes() {
        let routers = line();
        for _ in 0..3 {
            round(&routers);
        }
        assert_eq!(routers[1].forget_interface(2), 2);
        assert!(routers[1].route(30).is_none());
        assert!(routers[1].route(10).is_some());
    }

    #[test]
    fn stale_routes_expire() {
        let table = RoutingTable::new(1, 1);
        let then = Instant::now();
        table.integrate(0, 10, &RipDatagram::not_a_router(), then);
        assert_eq!(table.expire(then + Duration::from_secs(1), Duration::from_secs(2)), 0);
        assert_eq!(table.expire(then + Duration::from_secs(3), Duration::from_secs(2)), 1);
        assert!(table.is_empty());
    }
}
