//! Core simulation for the wastebots colony.
//!
//! A colony of autonomous robots collects, fuses, and retires hazardous
//! waste on a zoned grid. There is no central planner: each robot decides
//! from its own knowledge cache, peers coordinate through a one-tick-latency
//! message bus, and a single arbiter serializes every world mutation.

use rand::{
    Rng, RngCore, SeedableRng,
    rngs::SmallRng,
    seq::{IndexedRandom, SliceRandom},
};
use serde::{Deserialize, Serialize};
use slotmap::{SecondaryMap, SlotMap, new_key_type};
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;
use wastebots_grid::{
    GridError, HazardField, OccupancyIndex, Pos, UNREACHABLE, ZoneLayout, manhattan,
    manhattan_or_unreachable,
};

new_key_type! {
    /// Stable handle for robots backed by a generational slot map.
    pub struct RobotId;

    /// Stable handle for waste items.
    pub struct WasteId;
}

/// Inventory storage; the largest capacity in the colony is two units.
pub type Inventory = SmallVec<[WasteId; 2]>;

/// Waste/robot species. The tier names both the waste value and the robot
/// kind that processes it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tier {
    Green,
    Yellow,
    Red,
}

/// All tiers in processing order.
pub const TIERS: [Tier; 3] = [Tier::Green, Tier::Yellow, Tier::Red];

impl Tier {
    /// Maximum number of units a robot of this tier can carry.
    #[must_use]
    pub const fn capacity(self) -> usize {
        match self {
            Self::Green | Self::Yellow => 2,
            Self::Red => 1,
        }
    }

    /// Units required for a transforming drop.
    #[must_use]
    pub const fn fusion_count(self) -> usize {
        match self {
            Self::Green | Self::Yellow => 2,
            Self::Red => 1,
        }
    }

    /// Tier produced by fusing `fusion_count` units; `None` for Red, whose
    /// full drop is terminal disposal.
    #[must_use]
    pub const fn fusion_product(self) -> Option<Self> {
        match self {
            Self::Green => Some(Self::Yellow),
            Self::Yellow => Some(Self::Red),
            Self::Red => None,
        }
    }

    /// Material units represented by one item of this tier. Fusion
    /// conserves units; only disposal retires them.
    #[must_use]
    pub const fn material_units(self) -> u64 {
        match self {
            Self::Green => 1,
            Self::Yellow => 2,
            Self::Red => 4,
        }
    }
}

/// Per-cell table indexed by tier.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TierTable<T> {
    pub green: T,
    pub yellow: T,
    pub red: T,
}

impl<T> TierTable<T> {
    #[must_use]
    pub fn get(&self, tier: Tier) -> &T {
        match tier {
            Tier::Green => &self.green,
            Tier::Yellow => &self.yellow,
            Tier::Red => &self.red,
        }
    }

    pub fn get_mut(&mut self, tier: Tier) -> &mut T {
        match tier {
            Tier::Green => &mut self.green,
            Tier::Yellow => &mut self.yellow,
            Tier::Red => &mut self.red,
        }
    }
}

impl TierTable<usize> {
    /// Sum across the three tiers.
    #[must_use]
    pub fn total(&self) -> usize {
        self.green + self.yellow + self.red
    }
}

impl TierTable<u64> {
    /// Sum across the three tiers.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.green + self.yellow + self.red
    }
}

/// Static per-tier operating parameters, derived from the zone layout at
/// construction. Data fields, not subtype overrides.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TierParams {
    pub capacity: usize,
    pub tolerance: f32,
    pub home_zone: u32,
    pub left_border: u32,
    pub right_border: u32,
}

impl TierParams {
    fn derive(layout: &ZoneLayout, tier: Tier) -> Self {
        let zones = layout.zones();
        let ordinal = match tier {
            Tier::Green => 0,
            Tier::Yellow => 1,
            Tier::Red => zones.saturating_sub(1),
        };
        let home_zone = ordinal.min(zones - 1);
        let (_, home_right) = layout.span(home_zone);
        let (tolerance, right_border) = match tier {
            // Red roams every zone and must be able to stand on the
            // disposal sentinel.
            Tier::Red => (f32::INFINITY, layout.width() - 1),
            _ => ((home_zone + 1) as f32 / zones as f32, home_right),
        };
        Self {
            capacity: tier.capacity(),
            tolerance,
            home_zone,
            left_border: 0,
            right_border,
        }
    }
}

/// High level simulation clock (ticks processed since boot).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next sequential tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Resets the tick counter back to zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// Errors raised while building a colony.
#[derive(Debug, Error)]
pub enum ColonyError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Layout construction failed.
    #[error(transparent)]
    Grid(#[from] GridError),
}

/// Deliberation variant installed into every robot at construction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PolicyKind {
    /// Full decision engine plus the argue/commit/cancel pairing protocol.
    #[default]
    Negotiating,
    /// Decision engine without any messaging.
    Baseline,
    /// Random walk with opportunistic pick-up; control variant.
    Random,
}

/// Completion criterion evaluated after every tick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TerminationRule {
    /// The grid is clear and every inventory is empty.
    Strict,
    /// The grid is clear, no robot carries a full load, and at most
    /// `max_stranded` single units remain held by negotiating robots.
    /// Odd spawn counts leave one unpaired unit forever, so this is the
    /// default.
    Relaxed { max_stranded: usize },
}

impl Default for TerminationRule {
    fn default() -> Self {
        Self::Relaxed { max_stranded: 2 }
    }
}

/// Static configuration for a wastebots colony.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColonyConfig {
    /// Width of the grid in cells.
    pub grid_width: u32,
    /// Height of the grid in cells.
    pub grid_height: u32,
    /// Number of contiguous zone bands.
    pub zone_count: u32,
    /// Robots spawned per tier.
    pub green_robots: u32,
    pub yellow_robots: u32,
    pub red_robots: u32,
    /// Total waste scattered at spawn, split 70/20/10 across tiers unless
    /// `waste_mix` overrides the split with explicit counts.
    pub waste_total: u32,
    pub waste_mix: Option<(u32, u32, u32)>,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
    /// Deliberation variant installed into every robot.
    pub policy: PolicyKind,
    /// Completion criterion.
    pub termination: TerminationRule,
    /// Maximum number of recent tick stats retained in memory.
    pub history_capacity: usize,
}

impl Default for ColonyConfig {
    fn default() -> Self {
        Self {
            grid_width: 21,
            grid_height: 3,
            zone_count: 3,
            green_robots: 3,
            yellow_robots: 3,
            red_robots: 3,
            waste_total: 20,
            waste_mix: None,
            rng_seed: None,
            policy: PolicyKind::default(),
            termination: TerminationRule::default(),
            history_capacity: 256,
        }
    }
}

impl ColonyConfig {
    /// Per-tier waste counts: the explicit mix when given, otherwise the
    /// 70/20/10 split with rounding remainder assigned to Red.
    #[must_use]
    pub fn waste_counts(&self) -> (u32, u32, u32) {
        if let Some(mix) = self.waste_mix {
            return mix;
        }
        let green = self.waste_total * 7 / 10;
        let yellow = self.waste_total * 2 / 10;
        (green, yellow, self.waste_total - green - yellow)
    }

    fn validate(&self) -> Result<(), ColonyError> {
        if self.history_capacity == 0 {
            return Err(ColonyError::InvalidConfig(
                "history_capacity must be non-zero",
            ));
        }
        Ok(())
    }

    /// Returns the configured RNG, seeding from entropy when unset.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::seed_from_u64(rand::random()),
        }
    }
}

/// Where a waste item currently lives.
///
/// A single enum field guarantees an item is never simultaneously on the
/// grid and inside an inventory.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WasteLocation {
    OnGrid(Pos),
    Carried(RobotId),
    Consumed,
}

/// One waste item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Waste {
    pub tier: Tier,
    pub location: WasteLocation,
}

/// Owner of every waste item and of the monotonic recycling counter.
#[derive(Debug, Default)]
pub struct WasteLedger {
    items: SlotMap<WasteId, Waste>,
    index: OccupancyIndex<WasteId>,
    recycled: u64,
}

impl WasteLedger {
    fn spawn(&mut self, tier: Tier, pos: Pos) -> WasteId {
        let id = self.items.insert(Waste {
            tier,
            location: WasteLocation::OnGrid(pos),
        });
        self.index.place(id, pos);
        id
    }

    #[must_use]
    pub fn get(&self, id: WasteId) -> Option<&Waste> {
        self.items.get(id)
    }

    pub fn items(&self) -> impl Iterator<Item = (WasteId, &Waste)> {
        self.items.iter()
    }

    fn pick_up(&mut self, id: WasteId, by: RobotId) {
        if let Some(waste) = self.items.get_mut(id) {
            self.index.displace(id);
            waste.location = WasteLocation::Carried(by);
        }
    }

    fn place(&mut self, id: WasteId, pos: Pos) {
        if let Some(waste) = self.items.get_mut(id) {
            waste.location = WasteLocation::OnGrid(pos);
            self.index.place(id, pos);
        }
    }

    fn transfer(&mut self, id: WasteId, to: RobotId) {
        if let Some(waste) = self.items.get_mut(id) {
            waste.location = WasteLocation::Carried(to);
        }
    }

    fn consume(&mut self, id: WasteId) {
        if let Some(waste) = self.items.get_mut(id) {
            self.index.displace(id);
            waste.location = WasteLocation::Consumed;
        }
    }

    fn dispose(&mut self, id: WasteId) {
        self.consume(id);
        self.recycled += 1;
    }

    /// Number of items currently lying on the grid.
    #[must_use]
    pub fn on_grid(&self) -> usize {
        self.index.len()
    }

    /// Per-tier counts of items on the grid.
    #[must_use]
    pub fn on_grid_by_tier(&self) -> TierTable<usize> {
        let mut counts = TierTable::default();
        for (_, waste) in self.items.iter() {
            if matches!(waste.location, WasteLocation::OnGrid(_)) {
                *counts.get_mut(waste.tier) += 1;
            }
        }
        counts
    }

    /// Material units still in circulation (on the grid or carried).
    #[must_use]
    pub fn live_units(&self) -> u64 {
        self.items
            .values()
            .filter(|waste| !matches!(waste.location, WasteLocation::Consumed))
            .map(|waste| waste.tier.material_units())
            .sum()
    }

    /// Red items retired at the disposal cell so far.
    #[must_use]
    pub fn recycled(&self) -> u64 {
        self.recycled
    }
}

/// Speech acts of the coordination protocol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Performative {
    /// Soft reservation of a chosen target waste.
    InformRef(WasteId),
    /// "I hold a single unit and nothing is visible; come pair with me."
    Argue(RobotId),
    /// Acceptance of a pairing invitation.
    Commit(RobotId),
    /// Retraction of a prior argue/commit engagement.
    Cancel(RobotId),
}

/// Delivery scope of a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Audience {
    /// Every robot of the tier except the sender.
    Tier(Tier),
    /// A single recipient.
    Direct(RobotId),
}

/// A routed message. Messages sent during tick `t` become readable at the
/// start of tick `t + 1`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    pub sender: RobotId,
    pub tier: Tier,
    pub audience: Audience,
    pub performative: Performative,
    pub sent_at: Tick,
}

/// Message a policy wants sent; the scheduler stamps sender and tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Draft {
    pub audience: Audience,
    pub performative: Performative,
}

/// Store-and-forward bus with per-tier topics.
#[derive(Debug, Default)]
pub struct MessageBus {
    queued: Vec<Envelope>,
    mailboxes: SecondaryMap<RobotId, Vec<Envelope>>,
    sent: TierTable<u64>,
}

impl MessageBus {
    fn register(&mut self, robot: RobotId) {
        self.mailboxes.insert(robot, Vec::new());
    }

    fn post(&mut self, envelope: Envelope) {
        *self.sent.get_mut(envelope.tier) += 1;
        self.queued.push(envelope);
    }

    /// Move every queued envelope into its recipients' mailboxes. Called
    /// once at the start of each tick, which is what enforces the one-tick
    /// delivery latency.
    fn deliver(&mut self, roster: &TierTable<Vec<RobotId>>) {
        let queued = std::mem::take(&mut self.queued);
        for envelope in queued {
            match envelope.audience {
                Audience::Direct(to) => {
                    if let Some(mailbox) = self.mailboxes.get_mut(to) {
                        mailbox.push(envelope);
                    }
                }
                Audience::Tier(tier) => {
                    for &to in roster.get(tier) {
                        if to == envelope.sender {
                            continue;
                        }
                        if let Some(mailbox) = self.mailboxes.get_mut(to) {
                            mailbox.push(envelope);
                        }
                    }
                }
            }
        }
    }

    fn drain_mailbox(&mut self, robot: RobotId) -> Vec<Envelope> {
        self.mailboxes
            .get_mut(robot)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    /// Cumulative messages sent per tier.
    #[must_use]
    pub fn sent_totals(&self) -> TierTable<u64> {
        self.sent
    }
}

/// State snapshot handed back by the arbiter after every action. The only
/// channel through which a robot learns about mutations it did not cause.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Percept {
    pub tick: Tick,
    pub position: Pos,
    pub inventory: Inventory,
    pub wastes: TierTable<Vec<(WasteId, Pos)>>,
    pub robots: TierTable<Vec<(RobotId, Pos)>>,
}

/// Per-robot knowledge cache, rebuilt every activation by a pure
/// transition from the previous knowledge, the freshest percept, and the
/// tick's delivered messages.
#[derive(Debug, Clone, Default)]
pub struct Knowledge {
    pub tick: Tick,
    pub position: Pos,
    pub inventory: Inventory,
    pub wastes: TierTable<Vec<(WasteId, Pos)>>,
    pub robots: TierTable<Vec<(RobotId, Pos)>>,
    /// Soft reservations read from peers, stamped with the sending tick.
    /// Held for two ticks to bridge the sender-side rate limit.
    pub reserved: Vec<(WasteId, Tick)>,
    /// Standing pairing invitations; curated by Cancel messages.
    pub offers: Vec<(RobotId, Pos)>,
    /// Commits addressed to this robot, read this tick.
    pub commits: Vec<RobotId>,
    /// Cancel payloads read this tick.
    pub cancels: Vec<RobotId>,
}

impl Knowledge {
    /// Pure knowledge transition. No world access: everything the next
    /// knowledge contains comes from the arguments.
    #[must_use]
    pub fn advance(&self, percept: &Percept, inbox: &[Envelope]) -> Self {
        let mut next = Self {
            tick: percept.tick,
            position: percept.position,
            inventory: percept.inventory.clone(),
            wastes: percept.wastes.clone(),
            robots: percept.robots.clone(),
            reserved: Vec::new(),
            offers: Vec::new(),
            commits: Vec::new(),
            cancels: Vec::new(),
        };
        for &(id, stamp) in &self.reserved {
            if stamp.0 + 1 >= percept.tick.0 {
                next.reserved.push((id, stamp));
            }
        }
        // Cancels first, so a same-tick cancel prunes a stale offer.
        for envelope in inbox {
            if let Performative::Cancel(peer) = envelope.performative {
                next.cancels.push(peer);
            }
        }
        for &(peer, _) in &self.offers {
            if !next.cancels.contains(&peer)
                && let Some(pos) = Self::locate(&next.robots, peer)
            {
                next.offers.push((peer, pos));
            }
        }
        for envelope in inbox {
            match envelope.performative {
                Performative::InformRef(waste) => {
                    if !next.reserved.iter().any(|&(id, _)| id == waste) {
                        next.reserved.push((waste, envelope.sent_at));
                    }
                }
                Performative::Argue(peer) => {
                    if !next.cancels.contains(&peer)
                        && !next.offers.iter().any(|&(id, _)| id == peer)
                        && let Some(pos) = Self::locate(&next.robots, peer)
                    {
                        next.offers.push((peer, pos));
                    }
                }
                Performative::Commit(peer) => next.commits.push(peer),
                Performative::Cancel(_) => {}
            }
        }
        next
    }

    /// Whether a waste item is softly reserved by a peer.
    #[must_use]
    pub fn is_reserved(&self, waste: WasteId) -> bool {
        self.reserved.iter().any(|&(id, _)| id == waste)
    }

    fn locate(robots: &TierTable<Vec<(RobotId, Pos)>>, peer: RobotId) -> Option<Pos> {
        for tier in TIERS {
            if let Some(pos) = robots
                .get(tier)
                .iter()
                .copied()
                .find(|&(id, _)| id == peer)
                .map(|(_, pos)| pos)
            {
                return Some(pos);
            }
        }
        None
    }
}

/// Persistent pairing-protocol flags, kept across ticks because the
/// knowledge-derived policy alone cannot express an open engagement.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Negotiation {
    pub has_argued: bool,
    pub has_committed: bool,
    pub partner: Option<RobotId>,
    /// Compressed sent-log entry rate-limiting repeated InformRef.
    pub last_inform: Option<(WasteId, Tick)>,
}

impl Negotiation {
    fn reset_pairing(&mut self) {
        self.has_argued = false;
        self.has_committed = false;
        self.partner = None;
    }

    fn engaged(&self) -> bool {
        self.has_argued || self.has_committed || self.partner.is_some()
    }

    fn should_inform(&self, target: WasteId, now: Tick) -> bool {
        match self.last_inform {
            Some((id, sent)) if id == target => now.0 > sent.0 + 1,
            _ => true,
        }
    }
}

/// One robot. Tier-specific behavior comes from [`TierParams`] data and
/// the installed policy object, never from subtypes.
#[derive(Debug, Clone)]
pub struct Robot {
    pub tier: Tier,
    pub position: Pos,
    pub inventory: Inventory,
    pub negotiation: Negotiation,
    percept: Percept,
    knowledge: Knowledge,
}

/// Action submitted to the arbiter; at most one per robot per tick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Action {
    Move(Pos),
    PickUp(WasteId),
    Drop,
    Give { to: RobotId },
    Take { from: RobotId },
    Wait,
}

/// Everything a policy may read while deliberating.
pub struct PolicyView<'a> {
    pub me: RobotId,
    pub tier: Tier,
    pub position: Pos,
    pub inventory: &'a [WasteId],
    pub knowledge: &'a Knowledge,
    pub params: &'a TierParams,
    pub layout: &'a ZoneLayout,
    pub hazard: &'a HazardField,
    pub tick: Tick,
}

impl PolicyView<'_> {
    /// Whether another robot is known to stand on the cell.
    #[must_use]
    pub fn occupied(&self, pos: Pos) -> bool {
        for tier in TIERS {
            for &(id, robot_pos) in self.knowledge.robots.get(tier) {
                if robot_pos == pos && id != self.me {
                    return true;
                }
            }
        }
        false
    }

    pub fn peer_position(&self, peer: RobotId) -> Option<Pos> {
        self.knowledge
            .robots
            .get(self.tier)
            .iter()
            .copied()
            .find(|&(id, _)| id == peer)
            .map(|(_, pos)| pos)
    }

    pub fn passable(&self, pos: Pos) -> bool {
        pos.x >= self.params.left_border
            && pos.x <= self.params.right_border
            && self.hazard.tolerated(pos, self.params.tolerance)
            && !self.occupied(pos)
    }

    pub fn valid_neighbors(&self) -> Vec<Pos> {
        self.layout
            .neighbors4(self.position)
            .filter(|&pos| self.passable(pos))
            .collect()
    }

    /// One step toward `goal`: the passable neighbor minimizing the
    /// remaining distance, ties broken uniformly. Picking the minimum over
    /// the passable set rather than insisting on strict progress lets
    /// robots slide around a blocked cell instead of freezing head-on.
    pub fn step_toward(&self, goal: Pos, rng: &mut dyn RngCore) -> Option<Pos> {
        let mut best: Vec<Pos> = Vec::new();
        let mut best_distance = UNREACHABLE;
        for neighbor in self.valid_neighbors() {
            let distance = manhattan(neighbor, goal);
            if distance < best_distance {
                best_distance = distance;
                best.clear();
                best.push(neighbor);
            } else if distance == best_distance {
                best.push(neighbor);
            }
        }
        best.choose(rng).copied()
    }

    /// Idle wander over passable neighbors, optionally biased toward the
    /// zone's entry border (west), where transformed waste arrives.
    pub fn wander(&self, rng: &mut dyn RngCore, bias_entry: bool) -> Option<Pos> {
        let options = self.valid_neighbors();
        if options.is_empty() {
            return None;
        }
        if bias_entry && self.tier != Tier::Red {
            let westward: Vec<Pos> = options
                .iter()
                .copied()
                .filter(|pos| pos.x < self.position.x)
                .collect();
            if !westward.is_empty() && rng.random_bool(2.0 / 3.0) {
                return westward.choose(rng).copied();
            }
        }
        options.choose(rng).copied()
    }

    /// Whether any visible waste item, of any tier, lies on the cell the
    /// robot is standing on.
    #[must_use]
    pub fn standing_on_waste(&self) -> bool {
        TIERS.iter().any(|&tier| {
            self.knowledge
                .wastes
                .get(tier)
                .iter()
                .any(|&(_, pos)| pos == self.position)
        })
    }

    /// Manhattan-closest visible same-tier waste on a reachable cell,
    /// uniform tie-break. Softly reserved items are only skipped while an
    /// unreserved alternative exists; a reservation never blocks the last
    /// candidate, it just loses the race at pick-up.
    pub fn nearest_target(&self, rng: &mut dyn RngCore) -> Option<(WasteId, Pos)> {
        let mut candidates: Vec<(WasteId, Pos)> = self
            .knowledge
            .wastes
            .get(self.tier)
            .iter()
            .copied()
            .filter(|&(_, pos)| {
                pos.x >= self.params.left_border
                    && pos.x <= self.params.right_border
                    && self.hazard.tolerated(pos, self.params.tolerance)
                    && (pos == self.position || !self.occupied(pos))
            })
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let unreserved: Vec<(WasteId, Pos)> = candidates
            .iter()
            .copied()
            .filter(|&(id, _)| !self.knowledge.is_reserved(id))
            .collect();
        if !unreserved.is_empty() {
            candidates = unreserved;
        }
        let best_distance = candidates
            .iter()
            .map(|&(_, pos)| manhattan(self.position, pos))
            .min()?;
        let ties: Vec<(WasteId, Pos)> = candidates
            .into_iter()
            .filter(|&(_, pos)| manhattan(self.position, pos) == best_distance)
            .collect();
        ties.choose(rng).copied()
    }
}

/// Deliberation strategy installed per robot at construction.
pub trait RobotPolicy: Send {
    /// Static identifier of the policy implementation.
    fn kind(&self) -> &'static str;

    /// Map knowledge to one action, possibly queueing outbound messages
    /// and updating the persistent negotiation flags.
    fn decide(
        &mut self,
        view: &PolicyView<'_>,
        negotiation: &mut Negotiation,
        rng: &mut dyn RngCore,
        outbox: &mut Vec<Draft>,
    ) -> Action;
}

fn build_policy(kind: PolicyKind) -> Box<dyn RobotPolicy> {
    match kind {
        PolicyKind::Negotiating => Box::new(NegotiatingPolicy),
        PolicyKind::Baseline => Box::new(BaselinePolicy),
        PolicyKind::Random => Box::new(RandomPolicy),
    }
}

/// Full-capacity transport: Green/Yellow drift east to their right border,
/// Red walks to the disposal cell; arrival triggers the drop.
fn transport_step(view: &PolicyView<'_>, rng: &mut dyn RngCore) -> Action {
    match view.tier {
        Tier::Red => {
            let disposal = view.layout.disposal_cell();
            if view.position == disposal {
                Action::Drop
            } else {
                view.step_toward(disposal, rng)
                    .map_or(Action::Wait, Action::Move)
            }
        }
        _ => {
            if view.position.x >= view.params.right_border {
                Action::Drop
            } else {
                let goal = Pos::new(view.params.right_border, view.position.y);
                view.step_toward(goal, rng).map_or(Action::Wait, Action::Move)
            }
        }
    }
}

fn retract_engagement(view: &PolicyView<'_>, negotiation: &mut Negotiation, outbox: &mut Vec<Draft>) {
    if negotiation.engaged() {
        outbox.push(Draft {
            audience: Audience::Tier(view.tier),
            performative: Performative::Cancel(view.me),
        });
        negotiation.reset_pairing();
    }
}

/// Hold position while negotiating — unless the cell underneath carries a
/// waste item some other tier needs to reach; camping on it would make the
/// item untargetable forever.
fn hold_position(view: &PolicyView<'_>, rng: &mut dyn RngCore) -> Action {
    if view.standing_on_waste() {
        view.wander(rng, false).map_or(Action::Wait, Action::Move)
    } else {
        Action::Wait
    }
}

/// The communicating decision engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct NegotiatingPolicy;

impl NegotiatingPolicy {
    fn negotiate(
        view: &PolicyView<'_>,
        negotiation: &mut Negotiation,
        rng: &mut dyn RngCore,
        outbox: &mut Vec<Draft>,
    ) -> Action {
        // Paired already: the committer closes in and hands its unit over;
        // the arguer holds position so it can be found.
        if negotiation.has_committed
            && let Some(partner) = negotiation.partner
        {
            if let Some(partner_pos) = view.peer_position(partner) {
                if negotiation.has_argued {
                    return hold_position(view, rng);
                }
                if manhattan(view.position, partner_pos) <= 1 {
                    return Action::Give { to: partner };
                }
                return view
                    .step_toward(partner_pos, rng)
                    .map_or(Action::Wait, Action::Move);
            }
            negotiation.reset_pairing();
        }

        // Open arguer with commits on the table: take the nearest,
        // retract toward everyone else.
        if negotiation.has_argued && !view.knowledge.commits.is_empty() {
            let mut committers: Vec<(u32, RobotId)> = view
                .knowledge
                .commits
                .iter()
                .map(|&peer| {
                    (
                        manhattan_or_unreachable(Some(view.position), view.peer_position(peer)),
                        peer,
                    )
                })
                .collect();
            committers.sort();
            let (_, chosen) = committers[0];
            for &(_, other) in &committers[1..] {
                outbox.push(Draft {
                    audience: Audience::Direct(other),
                    performative: Performative::Cancel(view.me),
                });
            }
            negotiation.partner = Some(chosen);
            negotiation.has_committed = true;
            return hold_position(view, rng);
        }

        // Yield to a standing invitation. When both sides argued, only the
        // robot with the higher id yields, which breaks the symmetry.
        let mut offers: Vec<(u32, RobotId, Pos)> = view
            .knowledge
            .offers
            .iter()
            .copied()
            .filter(|&(peer, _)| peer != view.me && (!negotiation.has_argued || peer < view.me))
            .map(|(peer, pos)| (manhattan(view.position, pos), peer, pos))
            .collect();
        if !offers.is_empty() {
            offers.sort();
            let (_, chosen, chosen_pos) = offers[0];
            if negotiation.has_argued {
                outbox.push(Draft {
                    audience: Audience::Tier(view.tier),
                    performative: Performative::Cancel(view.me),
                });
            }
            negotiation.has_argued = false;
            negotiation.has_committed = true;
            negotiation.partner = Some(chosen);
            outbox.push(Draft {
                audience: Audience::Direct(chosen),
                performative: Performative::Commit(view.me),
            });
            return view
                .step_toward(chosen_pos, rng)
                .map_or(Action::Wait, Action::Move);
        }

        // Nobody to pair with yet: open an invitation and hold.
        if !negotiation.has_argued {
            negotiation.has_argued = true;
            outbox.push(Draft {
                audience: Audience::Tier(view.tier),
                performative: Performative::Argue(view.me),
            });
        }
        hold_position(view, rng)
    }
}

impl RobotPolicy for NegotiatingPolicy {
    fn kind(&self) -> &'static str {
        "negotiating"
    }

    fn decide(
        &mut self,
        view: &PolicyView<'_>,
        negotiation: &mut Negotiation,
        rng: &mut dyn RngCore,
        outbox: &mut Vec<Draft>,
    ) -> Action {
        // A cancel from the recorded partner reopens negotiation.
        if let Some(partner) = negotiation.partner
            && view.knowledge.cancels.contains(&partner)
        {
            negotiation.reset_pairing();
        }

        if view.inventory.len() >= view.params.capacity {
            retract_engagement(view, negotiation, outbox);
            return transport_step(view, rng);
        }

        if let Some((target, target_pos)) = view.nearest_target(rng) {
            retract_engagement(view, negotiation, outbox);
            if target_pos == view.position {
                return Action::PickUp(target);
            }
            if negotiation.should_inform(target, view.tick) {
                outbox.push(Draft {
                    audience: Audience::Tier(view.tier),
                    performative: Performative::InformRef(target),
                });
                negotiation.last_inform = Some((target, view.tick));
            }
            return view
                .step_toward(target_pos, rng)
                .map_or(Action::Wait, Action::Move);
        }

        if view.inventory.len() == 1 && view.tier.fusion_count() == 2 {
            return Self::negotiate(view, negotiation, rng, outbox);
        }

        retract_engagement(view, negotiation, outbox);
        view.wander(rng, true).map_or(Action::Wait, Action::Move)
    }
}

/// The decision engine without any messaging; a stranded single unit
/// keeps wandering instead of pairing up.
#[derive(Debug, Default, Clone, Copy)]
pub struct BaselinePolicy;

impl RobotPolicy for BaselinePolicy {
    fn kind(&self) -> &'static str {
        "baseline"
    }

    fn decide(
        &mut self,
        view: &PolicyView<'_>,
        _negotiation: &mut Negotiation,
        rng: &mut dyn RngCore,
        _outbox: &mut Vec<Draft>,
    ) -> Action {
        if view.inventory.len() >= view.params.capacity {
            return transport_step(view, rng);
        }
        if let Some((target, target_pos)) = view.nearest_target(rng) {
            if target_pos == view.position {
                return Action::PickUp(target);
            }
            return view
                .step_toward(target_pos, rng)
                .map_or(Action::Wait, Action::Move);
        }
        view.wander(rng, true).map_or(Action::Wait, Action::Move)
    }
}

/// Control variant: random walk, opportunistic pick-up, normal transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomPolicy;

impl RobotPolicy for RandomPolicy {
    fn kind(&self) -> &'static str {
        "random"
    }

    fn decide(
        &mut self,
        view: &PolicyView<'_>,
        _negotiation: &mut Negotiation,
        rng: &mut dyn RngCore,
        _outbox: &mut Vec<Draft>,
    ) -> Action {
        if view.inventory.len() >= view.params.capacity {
            return transport_step(view, rng);
        }
        if let Some(&(target, _)) = view
            .knowledge
            .wastes
            .get(view.tier)
            .iter()
            .find(|&&(_, pos)| pos == view.position)
        {
            return Action::PickUp(target);
        }
        view.wander(rng, false).map_or(Action::Wait, Action::Move)
    }
}

/// Per-tick statistics sampled after all robots have acted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TickStats {
    pub tick: Tick,
    /// Items lying on the grid, by tier.
    pub on_grid: TierTable<usize>,
    /// Items held in inventories across the colony.
    pub carried: usize,
    /// Material units still in circulation.
    pub live_units: u64,
    /// Red items retired at the disposal cell so far.
    pub recycled: u64,
    /// Cumulative messages sent, by tier.
    pub messages: TierTable<u64>,
    /// Actions the arbiter refused this tick.
    pub rejected: u64,
}

/// Observation hook invoked after each tick.
pub trait RunObserver: Send {
    fn on_tick(&mut self, stats: &TickStats);
}

/// No-op observer.
#[derive(Debug, Default)]
pub struct NullObserver;

impl RunObserver for NullObserver {
    fn on_tick(&mut self, _stats: &TickStats) {}
}

/// Read-only state bundle for rendering and reporting layers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorldSnapshot {
    pub tick: Tick,
    pub width: u32,
    pub height: u32,
    pub hazard: Vec<f32>,
    pub wastes: Vec<(Pos, Tier)>,
    pub robots: Vec<(Pos, Tier, usize)>,
    pub recycled: u64,
}

/// Outcome of a bounded run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RunOutcome {
    /// The termination rule was satisfied after this many ticks.
    Completed { ticks: u64 },
    /// The tick budget ran out first.
    TickLimit { ticks: u64 },
}

/// The colony: grid, waste ledger, robots, message bus, and the arbiter
/// that owns every mutation of shared state.
pub struct Colony {
    config: ColonyConfig,
    params: TierTable<TierParams>,
    layout: ZoneLayout,
    hazard: HazardField,
    tick: Tick,
    rng: SmallRng,
    robots: SlotMap<RobotId, Robot>,
    policies: SecondaryMap<RobotId, Box<dyn RobotPolicy>>,
    robot_index: OccupancyIndex<RobotId>,
    roster: TierTable<Vec<RobotId>>,
    ledger: WasteLedger,
    bus: MessageBus,
    observer: Box<dyn RunObserver>,
    history: VecDeque<TickStats>,
    rejected_this_tick: u64,
}

impl fmt::Debug for Colony {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Colony")
            .field("config", &self.config)
            .field("tick", &self.tick)
            .field("robot_count", &self.robots.len())
            .field("on_grid_waste", &self.ledger.on_grid())
            .field("recycled", &self.ledger.recycled())
            .finish()
    }
}

impl Colony {
    /// Build a colony with the default (silent) observer.
    pub fn new(config: ColonyConfig) -> Result<Self, ColonyError> {
        Self::with_observer(config, Box::new(NullObserver))
    }

    /// Build a colony and attach an observation hook.
    pub fn with_observer(
        config: ColonyConfig,
        observer: Box<dyn RunObserver>,
    ) -> Result<Self, ColonyError> {
        config.validate()?;
        let layout = ZoneLayout::new(config.grid_width, config.grid_height, config.zone_count)?;
        let mut rng = config.seeded_rng();
        let hazard = HazardField::sample(&layout, &mut rng);
        let params = TierTable {
            green: TierParams::derive(&layout, Tier::Green),
            yellow: TierParams::derive(&layout, Tier::Yellow),
            red: TierParams::derive(&layout, Tier::Red),
        };
        let mut colony = Self {
            config,
            params,
            layout,
            hazard,
            tick: Tick::zero(),
            rng,
            robots: SlotMap::with_key(),
            policies: SecondaryMap::new(),
            robot_index: OccupancyIndex::new(),
            roster: TierTable::default(),
            ledger: WasteLedger::default(),
            bus: MessageBus::default(),
            observer,
            history: VecDeque::new(),
            rejected_this_tick: 0,
        };
        colony.seed_population()?;
        Ok(colony)
    }

    fn seed_population(&mut self) -> Result<(), ColonyError> {
        let (green, yellow, red) = self.config.waste_counts();
        let waste_plan = [
            (Tier::Green, green),
            (Tier::Yellow, yellow),
            (Tier::Red, red),
        ];
        for (tier, count) in waste_plan {
            let zone = self.params.get(tier).home_zone;
            for _ in 0..count {
                let pos = self.waste_cell_in_zone(zone)?;
                self.ledger.spawn(tier, pos);
            }
        }
        let robot_plan = [
            (Tier::Green, self.config.green_robots),
            (Tier::Yellow, self.config.yellow_robots),
            (Tier::Red, self.config.red_robots),
        ];
        for (tier, count) in robot_plan {
            let zone = self.params.get(tier).home_zone;
            for _ in 0..count {
                let pos = self.free_cell_in_zone(zone)?;
                self.spawn_robot(tier, pos);
            }
        }
        Ok(())
    }

    fn waste_cell_in_zone(&mut self, zone: u32) -> Result<Pos, ColonyError> {
        let (left, right) = self.layout.span(zone);
        let height = self.layout.height();
        let disposal = self.layout.disposal_cell();
        for _ in 0..128 {
            let pos = Pos::new(
                self.rng.random_range(left..=right),
                self.rng.random_range(0..height),
            );
            if pos != disposal {
                return Ok(pos);
            }
        }
        for x in left..=right {
            for y in 0..height {
                let pos = Pos::new(x, y);
                if pos != disposal {
                    return Ok(pos);
                }
            }
        }
        Err(ColonyError::InvalidConfig(
            "zone has no cell available for waste placement",
        ))
    }

    fn free_cell_in_zone(&mut self, zone: u32) -> Result<Pos, ColonyError> {
        let (left, right) = self.layout.span(zone);
        let height = self.layout.height();
        let disposal = self.layout.disposal_cell();
        for _ in 0..128 {
            let pos = Pos::new(
                self.rng.random_range(left..=right),
                self.rng.random_range(0..height),
            );
            if pos != disposal && self.robot_index.is_free(pos) {
                return Ok(pos);
            }
        }
        for x in left..=right {
            for y in 0..height {
                let pos = Pos::new(x, y);
                if pos != disposal && self.robot_index.is_free(pos) {
                    return Ok(pos);
                }
            }
        }
        Err(ColonyError::InvalidConfig(
            "zone has no free cell left for robot placement",
        ))
    }

    /// Spawn a robot at an explicit position (wastes present at spawn time
    /// are included in its initial percept).
    pub fn spawn_robot(&mut self, tier: Tier, pos: Pos) -> RobotId {
        let id = self.robots.insert(Robot {
            tier,
            position: pos,
            inventory: Inventory::new(),
            negotiation: Negotiation::default(),
            percept: Percept::default(),
            knowledge: Knowledge::default(),
        });
        self.robot_index.place(id, pos);
        self.roster.get_mut(tier).push(id);
        self.bus.register(id);
        self.policies.insert(id, build_policy(self.config.policy));
        let percept = self.percept_for(id);
        self.robots[id].percept = percept;
        id
    }

    /// Place a waste item at an explicit position.
    pub fn spawn_waste(&mut self, tier: Tier, pos: Pos) -> WasteId {
        self.ledger.spawn(tier, pos)
    }

    /// Execute one tick: deliver queued messages, activate every robot
    /// once in random order, then sample statistics.
    pub fn step(&mut self) -> TickStats {
        self.tick = self.tick.next();
        self.rejected_this_tick = 0;
        self.bus.deliver(&self.roster);

        let mut order: Vec<RobotId> = self.robots.keys().collect();
        order.shuffle(&mut self.rng);

        for id in order {
            let inbox = self.bus.drain_mailbox(id);
            let next_knowledge = self.robots[id].knowledge.advance(&self.robots[id].percept, &inbox);
            self.robots[id].knowledge = next_knowledge;

            let mut negotiation = std::mem::take(&mut self.robots[id].negotiation);
            let mut outbox: Vec<Draft> = Vec::new();
            let action = {
                let robot = &self.robots[id];
                let view = PolicyView {
                    me: id,
                    tier: robot.tier,
                    position: robot.position,
                    inventory: &robot.inventory,
                    knowledge: &robot.knowledge,
                    params: self.params.get(robot.tier),
                    layout: &self.layout,
                    hazard: &self.hazard,
                    tick: self.tick,
                };
                match self.policies.get_mut(id) {
                    Some(policy) => policy.decide(&view, &mut negotiation, &mut self.rng, &mut outbox),
                    None => Action::Wait,
                }
            };
            self.robots[id].negotiation = negotiation;

            let tier = self.robots[id].tier;
            for draft in outbox {
                self.bus.post(Envelope {
                    sender: id,
                    tier,
                    audience: draft.audience,
                    performative: draft.performative,
                    sent_at: self.tick,
                });
            }

            let percept = self.apply(id, action);
            self.robots[id].percept = percept;
        }

        let stats = self.collect_stats();
        self.observer.on_tick(&stats);
        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(stats.clone());
        stats
    }

    /// Validate and execute one action, returning a fresh percept. The
    /// sole mutation point of shared state: grid occupancy, the waste
    /// ledger, and inventories only change here.
    pub fn apply(&mut self, id: RobotId, action: Action) -> Percept {
        match action {
            Action::Wait => {}
            Action::Move(dest) => self.apply_move(id, dest),
            Action::PickUp(waste) => self.apply_pick_up(id, waste),
            Action::Drop => self.apply_drop(id),
            Action::Give { to } => self.apply_transfer(id, to),
            Action::Take { from } => self.apply_transfer(from, id),
        }
        self.percept_for(id)
    }

    fn apply_move(&mut self, id: RobotId, dest: Pos) {
        let valid = {
            let robot = &self.robots[id];
            let params = self.params.get(robot.tier);
            self.layout.contains(dest)
                && manhattan(robot.position, dest) == 1
                && dest.x >= params.left_border
                && dest.x <= params.right_border
                && self.hazard.tolerated(dest, params.tolerance)
                && self.robot_index.is_free(dest)
        };
        if valid {
            self.robots[id].position = dest;
            self.robot_index.place(id, dest);
        } else {
            self.rejected_this_tick += 1;
        }
    }

    fn apply_pick_up(&mut self, id: RobotId, waste_id: WasteId) {
        let (tier, position, capacity) = {
            let robot = &self.robots[id];
            (
                robot.tier,
                robot.position,
                self.params.get(robot.tier).capacity,
            )
        };
        let Some(waste) = self.ledger.get(waste_id).copied() else {
            return; // never existed: treat like a stale reference
        };
        match waste.location {
            WasteLocation::OnGrid(pos) if pos == position => {
                if waste.tier == tier && self.robots[id].inventory.len() < capacity {
                    self.ledger.pick_up(waste_id, id);
                    self.robots[id].inventory.push(waste_id);
                } else {
                    self.rejected_this_tick += 1;
                }
            }
            WasteLocation::OnGrid(_) => {
                // Not co-located: a contract violation, not a race.
                self.rejected_this_tick += 1;
            }
            // Already carried or consumed: the stale-reservation race,
            // recovered silently by re-deliberating with fresh percepts.
            WasteLocation::Carried(_) | WasteLocation::Consumed => {}
        }
    }

    fn apply_drop(&mut self, id: RobotId) {
        let (tier, position) = {
            let robot = &self.robots[id];
            (robot.tier, robot.position)
        };
        let held = std::mem::take(&mut self.robots[id].inventory);
        if held.is_empty() {
            self.rejected_this_tick += 1;
            return;
        }
        match tier {
            Tier::Red => {
                let waste_id = held[0];
                if position == self.layout.disposal_cell() {
                    self.ledger.dispose(waste_id);
                } else {
                    self.ledger.place(waste_id, position);
                }
            }
            _ => {
                if held.len() == tier.fusion_count()
                    && let Some(product) = tier.fusion_product()
                {
                    for &waste_id in &held {
                        self.ledger.consume(waste_id);
                    }
                    self.ledger.spawn(product, position);
                } else {
                    // Below the fusion threshold: the held unit goes back
                    // on the grid unchanged.
                    for &waste_id in &held {
                        self.ledger.place(waste_id, position);
                    }
                }
            }
        }
    }

    fn apply_transfer(&mut self, giver: RobotId, taker: RobotId) {
        let valid = match (self.robots.get(giver), self.robots.get(taker)) {
            (Some(g), Some(t)) => {
                giver != taker
                    && g.tier == t.tier
                    && manhattan(g.position, t.position) <= 1
                    && !g.inventory.is_empty()
                    && t.inventory.len() < self.params.get(t.tier).capacity
            }
            _ => false,
        };
        if !valid {
            self.rejected_this_tick += 1;
            return;
        }
        if let Some(waste_id) = self.robots[giver].inventory.pop() {
            self.robots[taker].inventory.push(waste_id);
            self.ledger.transfer(waste_id, taker);
        }
    }

    fn percept_for(&self, id: RobotId) -> Percept {
        let mut wastes: TierTable<Vec<(WasteId, Pos)>> = TierTable::default();
        for (waste_id, waste) in self.ledger.items() {
            if let WasteLocation::OnGrid(pos) = waste.location {
                wastes.get_mut(waste.tier).push((waste_id, pos));
            }
        }
        let mut robots: TierTable<Vec<(RobotId, Pos)>> = TierTable::default();
        for (robot_id, robot) in self.robots.iter() {
            robots.get_mut(robot.tier).push((robot_id, robot.position));
        }
        let robot = &self.robots[id];
        Percept {
            tick: self.tick,
            position: robot.position,
            inventory: robot.inventory.clone(),
            wastes,
            robots,
        }
    }

    fn collect_stats(&self) -> TickStats {
        TickStats {
            tick: self.tick,
            on_grid: self.ledger.on_grid_by_tier(),
            carried: self.robots.values().map(|robot| robot.inventory.len()).sum(),
            live_units: self.ledger.live_units(),
            recycled: self.ledger.recycled(),
            messages: self.bus.sent_totals(),
            rejected: self.rejected_this_tick,
        }
    }

    /// Whether the configured termination rule is satisfied.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        if self.ledger.on_grid() > 0 {
            return false;
        }
        match self.config.termination {
            TerminationRule::Strict => self.robots.values().all(|robot| robot.inventory.is_empty()),
            TerminationRule::Relaxed { max_stranded } => {
                let mut stranded = 0;
                for robot in self.robots.values() {
                    let capacity = self.params.get(robot.tier).capacity;
                    if robot.inventory.len() >= capacity && capacity > 0 {
                        return false; // a full load is still in flight
                    }
                    stranded += robot.inventory.len();
                }
                stranded <= max_stranded
            }
        }
    }

    /// Step until the termination rule holds or the tick budget runs out.
    pub fn run_while(&mut self, max_ticks: u64) -> RunOutcome {
        while !self.is_complete() {
            if self.tick.0 >= max_ticks {
                return RunOutcome::TickLimit { ticks: self.tick.0 };
            }
            self.step();
        }
        RunOutcome::Completed { ticks: self.tick.0 }
    }

    /// Read-only bundle for rendering and reporting layers.
    #[must_use]
    pub fn snapshot(&self) -> WorldSnapshot {
        let mut wastes = Vec::with_capacity(self.ledger.on_grid());
        for (_, waste) in self.ledger.items() {
            if let WasteLocation::OnGrid(pos) = waste.location {
                wastes.push((pos, waste.tier));
            }
        }
        let robots = self
            .robots
            .values()
            .map(|robot| (robot.position, robot.tier, robot.inventory.len()))
            .collect();
        WorldSnapshot {
            tick: self.tick,
            width: self.layout.width(),
            height: self.layout.height(),
            hazard: self.hazard.cells().to_vec(),
            wastes,
            robots,
            recycled: self.ledger.recycled(),
        }
    }

    /// Current simulation tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Immutable access to the configuration.
    #[must_use]
    pub fn config(&self) -> &ColonyConfig {
        &self.config
    }

    /// Zone layout of the grid.
    #[must_use]
    pub fn layout(&self) -> &ZoneLayout {
        &self.layout
    }

    /// Operating parameters of a tier.
    #[must_use]
    pub fn tier_params(&self, tier: Tier) -> &TierParams {
        self.params.get(tier)
    }

    /// Iterate over all robots.
    pub fn robots(&self) -> impl Iterator<Item = (RobotId, &Robot)> {
        self.robots.iter()
    }

    /// Borrow a single robot.
    #[must_use]
    pub fn robot(&self, id: RobotId) -> Option<&Robot> {
        self.robots.get(id)
    }

    /// Borrow the waste ledger.
    #[must_use]
    pub fn ledger(&self) -> &WasteLedger {
        &self.ledger
    }

    /// Items currently lying on the grid.
    #[must_use]
    pub fn on_grid_waste(&self) -> usize {
        self.ledger.on_grid()
    }

    /// Red items retired at the disposal cell so far.
    #[must_use]
    pub fn recycled(&self) -> u64 {
        self.ledger.recycled()
    }

    /// Material units still in circulation.
    #[must_use]
    pub fn live_units(&self) -> u64 {
        self.ledger.live_units()
    }

    /// Cumulative messages sent per tier.
    #[must_use]
    pub fn messages_sent(&self) -> TierTable<u64> {
        self.bus.sent_totals()
    }

    /// Actions the arbiter refused during the tick in progress (or, between
    /// steps, since the last tick boundary).
    #[must_use]
    pub fn rejected_actions(&self) -> u64 {
        self.rejected_this_tick
    }

    /// Iterate over retained tick statistics.
    pub fn history(&self) -> impl Iterator<Item = &TickStats> {
        self.history.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_config() -> ColonyConfig {
        ColonyConfig {
            green_robots: 0,
            yellow_robots: 0,
            red_robots: 0,
            waste_total: 0,
            rng_seed: Some(5),
            ..ColonyConfig::default()
        }
    }

    fn bare_colony() -> Colony {
        Colony::new(bare_config()).expect("colony")
    }

    #[test]
    fn waste_counts_split_seventy_twenty_ten() {
        let config = ColonyConfig {
            waste_total: 20,
            ..ColonyConfig::default()
        };
        assert_eq!(config.waste_counts(), (14, 4, 2));

        let explicit = ColonyConfig {
            waste_mix: Some((11, 3, 2)),
            ..ColonyConfig::default()
        };
        assert_eq!(explicit.waste_counts(), (11, 3, 2));
    }

    #[test]
    fn config_validation_rejects_bad_values() {
        let config = ColonyConfig {
            history_capacity: 0,
            ..bare_config()
        };
        assert!(matches!(
            Colony::new(config),
            Err(ColonyError::InvalidConfig(_))
        ));

        let config = ColonyConfig {
            grid_width: 0,
            ..bare_config()
        };
        assert!(matches!(Colony::new(config), Err(ColonyError::Grid(_))));
    }

    #[test]
    fn colony_seeds_population_inside_home_zones() {
        let config = ColonyConfig {
            rng_seed: Some(42),
            ..ColonyConfig::default()
        };
        let colony = Colony::new(config).expect("colony");
        let layout = *colony.layout();

        assert_eq!(colony.on_grid_waste(), 20);
        for (_, waste) in colony.ledger().items() {
            let WasteLocation::OnGrid(pos) = waste.location else {
                panic!("freshly seeded waste must be on the grid");
            };
            let home = colony.tier_params(waste.tier).home_zone;
            assert_eq!(layout.zone_of(pos.x), home);
            assert_ne!(pos, layout.disposal_cell());
        }

        let mut by_tier: TierTable<usize> = TierTable::default();
        for (_, robot) in colony.robots() {
            assert!(robot.inventory.is_empty());
            let home = colony.tier_params(robot.tier).home_zone;
            assert_eq!(layout.zone_of(robot.position.x), home);
            *by_tier.get_mut(robot.tier) += 1;
        }
        assert_eq!(by_tier, TierTable { green: 3, yellow: 3, red: 3 });
    }

    #[test]
    fn two_green_items_fuse_into_yellow_at_the_drop_cell() {
        let mut colony = bare_colony();
        let cell = Pos::new(3, 1);
        let w1 = colony.spawn_waste(Tier::Green, cell);
        let w2 = colony.spawn_waste(Tier::Green, cell);
        let robot = colony.spawn_robot(Tier::Green, cell);

        colony.apply(robot, Action::PickUp(w1));
        colony.apply(robot, Action::PickUp(w2));
        assert_eq!(colony.robot(robot).expect("robot").inventory.len(), 2);
        assert_eq!(colony.on_grid_waste(), 0);

        let drop_cell = Pos::new(4, 1);
        colony.apply(robot, Action::Move(drop_cell));
        let percept = colony.apply(robot, Action::Drop);

        assert!(percept.inventory.is_empty());
        assert_eq!(colony.ledger().get(w1).expect("w1").location, WasteLocation::Consumed);
        assert_eq!(colony.ledger().get(w2).expect("w2").location, WasteLocation::Consumed);
        assert_eq!(percept.wastes.yellow.len(), 1);
        assert_eq!(percept.wastes.yellow[0].1, drop_cell);
        // Fusion conserves material units.
        assert_eq!(colony.live_units(), 2);
    }

    #[test]
    fn partial_drop_returns_the_single_item_unchanged() {
        let mut colony = bare_colony();
        let cell = Pos::new(2, 0);
        let waste = colony.spawn_waste(Tier::Green, cell);
        let robot = colony.spawn_robot(Tier::Green, cell);

        colony.apply(robot, Action::PickUp(waste));
        let percept = colony.apply(robot, Action::Drop);

        assert!(percept.inventory.is_empty());
        assert_eq!(
            colony.ledger().get(waste).expect("waste").location,
            WasteLocation::OnGrid(cell)
        );
        assert_eq!(colony.ledger().get(waste).expect("waste").tier, Tier::Green);
    }

    #[test]
    fn red_drop_at_disposal_increments_recycled() {
        let mut colony = bare_colony();
        let disposal = colony.layout().disposal_cell();
        let start = Pos::new(disposal.x, disposal.y - 1);
        let waste = colony.spawn_waste(Tier::Red, start);
        let robot = colony.spawn_robot(Tier::Red, start);

        colony.apply(robot, Action::PickUp(waste));
        // Anywhere else, the item just goes back on the grid.
        let percept = colony.apply(robot, Action::Drop);
        assert_eq!(percept.wastes.red.len(), 1);
        assert_eq!(colony.recycled(), 0);

        colony.apply(robot, Action::PickUp(waste));
        colony.apply(robot, Action::Move(disposal));
        colony.apply(robot, Action::Drop);

        assert_eq!(colony.recycled(), 1);
        assert_eq!(
            colony.ledger().get(waste).expect("waste").location,
            WasteLocation::Consumed
        );
        assert_eq!(colony.live_units(), 0);
    }

    #[test]
    fn losing_a_pick_up_race_is_a_silent_no_op() {
        let mut colony = bare_colony();
        let cell = Pos::new(3, 1);
        let waste = colony.spawn_waste(Tier::Green, cell);
        let first = colony.spawn_robot(Tier::Green, cell);
        let second = colony.spawn_robot(Tier::Green, Pos::new(3, 0));

        colony.apply(first, Action::PickUp(waste));
        colony.apply(first, Action::Move(Pos::new(2, 1)));
        colony.apply(second, Action::Move(cell));
        let before = colony.rejected_actions();
        let percept = colony.apply(second, Action::PickUp(waste));

        assert!(percept.inventory.is_empty());
        assert_eq!(colony.rejected_actions(), before, "a lost race is not a violation");
        assert_eq!(colony.robot(first).expect("first").inventory.len(), 1);
    }

    #[test]
    fn arbiter_rejects_invalid_moves() {
        let mut colony = bare_colony();
        let green = colony.spawn_robot(Tier::Green, Pos::new(5, 1));
        let other = colony.spawn_robot(Tier::Green, Pos::new(5, 0));
        let border = colony.tier_params(Tier::Green).right_border;
        assert_eq!(border, 6);

        // Teleports are refused.
        colony.apply(green, Action::Move(Pos::new(0, 0)));
        assert_eq!(colony.rejected_actions(), 1);
        // Occupied cells are refused.
        colony.apply(green, Action::Move(Pos::new(5, 0)));
        assert_eq!(colony.rejected_actions(), 2);
        assert_eq!(colony.robot(green).expect("green").position, Pos::new(5, 1));

        // The zone border holds even for a robot standing on it.
        let at_border = colony.spawn_robot(Tier::Green, Pos::new(border, 2));
        colony.apply(at_border, Action::Move(Pos::new(border + 1, 2)));
        assert_eq!(colony.rejected_actions(), 3);
        assert_eq!(
            colony.robot(at_border).expect("at_border").position,
            Pos::new(border, 2)
        );
        let _ = other;
    }

    #[test]
    fn give_transfers_one_unit_between_adjacent_peers() {
        let mut colony = bare_colony();
        let cell = Pos::new(2, 1);
        let waste = colony.spawn_waste(Tier::Green, cell);
        let giver = colony.spawn_robot(Tier::Green, cell);
        let taker = colony.spawn_robot(Tier::Green, Pos::new(2, 2));

        colony.apply(giver, Action::PickUp(waste));
        colony.apply(giver, Action::Give { to: taker });

        assert!(colony.robot(giver).expect("giver").inventory.is_empty());
        assert_eq!(colony.robot(taker).expect("taker").inventory.len(), 1);
        assert_eq!(
            colony.ledger().get(waste).expect("waste").location,
            WasteLocation::Carried(taker)
        );

        // Giving with an empty inventory is a contract violation.
        let before = colony.rejected_actions();
        colony.apply(giver, Action::Give { to: taker });
        assert_eq!(colony.rejected_actions(), before + 1);

        // Take is the symmetric pull.
        colony.apply(giver, Action::Take { from: taker });
        assert_eq!(colony.robot(giver).expect("giver").inventory.len(), 1);
        assert!(colony.robot(taker).expect("taker").inventory.is_empty());
    }

    #[test]
    fn transfer_to_a_distant_peer_is_rejected() {
        let mut colony = bare_colony();
        let cell = Pos::new(1, 0);
        let waste = colony.spawn_waste(Tier::Green, cell);
        let giver = colony.spawn_robot(Tier::Green, cell);
        let taker = colony.spawn_robot(Tier::Green, Pos::new(5, 2));

        colony.apply(giver, Action::PickUp(waste));
        let before = colony.rejected_actions();
        colony.apply(giver, Action::Give { to: taker });
        assert_eq!(colony.rejected_actions(), before + 1);
        assert_eq!(colony.robot(giver).expect("giver").inventory.len(), 1);
    }

    #[test]
    fn messages_are_delivered_with_one_tick_latency() {
        let mut bus = MessageBus::default();
        let mut robots: SlotMap<RobotId, ()> = SlotMap::with_key();
        let a = robots.insert(());
        let b = robots.insert(());
        let c = robots.insert(());
        bus.register(a);
        bus.register(b);
        bus.register(c);
        let roster = TierTable {
            green: vec![a, b, c],
            yellow: Vec::new(),
            red: Vec::new(),
        };

        bus.post(Envelope {
            sender: a,
            tier: Tier::Green,
            audience: Audience::Tier(Tier::Green),
            performative: Performative::Argue(a),
            sent_at: Tick(1),
        });

        // Nothing is readable within the sending tick.
        assert!(bus.drain_mailbox(b).is_empty());

        bus.deliver(&roster);
        let inbox_b = bus.drain_mailbox(b);
        let inbox_c = bus.drain_mailbox(c);
        assert_eq!(inbox_b.len(), 1);
        assert_eq!(inbox_c.len(), 1);
        // Broadcast excludes the sender.
        assert!(bus.drain_mailbox(a).is_empty());
        assert_eq!(bus.sent_totals().green, 1);
    }

    #[test]
    fn knowledge_advance_is_pure_and_folds_messages() {
        let mut wastes: SlotMap<WasteId, ()> = SlotMap::with_key();
        let w = wastes.insert(());
        let mut robots: SlotMap<RobotId, ()> = SlotMap::with_key();
        let me = robots.insert(());
        let peer = robots.insert(());

        let percept = Percept {
            tick: Tick(3),
            position: Pos::new(1, 1),
            inventory: Inventory::new(),
            wastes: TierTable {
                green: vec![(w, Pos::new(4, 1))],
                ..TierTable::default()
            },
            robots: TierTable {
                green: vec![(me, Pos::new(1, 1)), (peer, Pos::new(6, 2))],
                ..TierTable::default()
            },
        };
        let inbox = vec![
            Envelope {
                sender: peer,
                tier: Tier::Green,
                audience: Audience::Tier(Tier::Green),
                performative: Performative::InformRef(w),
                sent_at: Tick(2),
            },
            Envelope {
                sender: peer,
                tier: Tier::Green,
                audience: Audience::Tier(Tier::Green),
                performative: Performative::Argue(peer),
                sent_at: Tick(2),
            },
        ];

        let previous = Knowledge::default();
        let first = previous.advance(&percept, &inbox);
        let second = previous.advance(&percept, &inbox);
        assert_eq!(first.position, second.position);
        assert_eq!(first.reserved, second.reserved);
        assert_eq!(first.offers, second.offers);

        assert!(first.is_reserved(w));
        assert_eq!(first.offers, vec![(peer, Pos::new(6, 2))]);

        // Standing offers survive the next transition until cancelled.
        let carried = first.advance(&percept, &[]);
        assert_eq!(carried.offers, vec![(peer, Pos::new(6, 2))]);
        let cancel = vec![Envelope {
            sender: peer,
            tier: Tier::Green,
            audience: Audience::Tier(Tier::Green),
            performative: Performative::Cancel(peer),
            sent_at: Tick(4),
        }];
        let cleared = carried.advance(&percept, &cancel);
        assert!(cleared.offers.is_empty());
    }

    #[test]
    fn inform_is_rate_limited_on_consecutive_ticks() {
        let config = ColonyConfig {
            waste_total: 0,
            green_robots: 0,
            yellow_robots: 0,
            red_robots: 0,
            rng_seed: Some(17),
            ..ColonyConfig::default()
        };
        let mut colony = Colony::new(config).expect("colony");
        colony.spawn_waste(Tier::Green, Pos::new(6, 1));
        colony.spawn_robot(Tier::Green, Pos::new(0, 0));
        colony.spawn_robot(Tier::Green, Pos::new(0, 2));

        colony.step();
        assert_eq!(colony.messages_sent().green, 2, "both robots announce the target");
        colony.step();
        assert_eq!(
            colony.messages_sent().green,
            2,
            "the same target is not re-announced on the next tick"
        );
        colony.step();
        assert_eq!(colony.messages_sent().green, 4, "announcements resume after the gap");
    }

    #[test]
    fn strict_termination_requires_empty_inventories() {
        let mut relaxed = bare_colony();
        let cell = Pos::new(1, 1);
        let waste = relaxed.spawn_waste(Tier::Green, cell);
        let robot = relaxed.spawn_robot(Tier::Green, cell);
        relaxed.apply(robot, Action::PickUp(waste));
        assert!(relaxed.is_complete(), "one stranded unit is tolerated");

        let strict_config = ColonyConfig {
            termination: TerminationRule::Strict,
            ..bare_config()
        };
        let mut strict = Colony::new(strict_config).expect("colony");
        let waste = strict.spawn_waste(Tier::Green, cell);
        let robot = strict.spawn_robot(Tier::Green, cell);
        assert!(!strict.is_complete(), "waste on the grid blocks completion");
        strict.apply(robot, Action::PickUp(waste));
        assert!(!strict.is_complete(), "a held unit blocks the strict rule");
    }

    #[test]
    fn full_inventories_always_block_completion() {
        let mut colony = bare_colony();
        let cell = Pos::new(2, 1);
        let w1 = colony.spawn_waste(Tier::Green, cell);
        let w2 = colony.spawn_waste(Tier::Green, cell);
        let robot = colony.spawn_robot(Tier::Green, cell);
        colony.apply(robot, Action::PickUp(w1));
        colony.apply(robot, Action::PickUp(w2));
        assert!(!colony.is_complete(), "a full load is in flight");

        let mut colony = bare_colony();
        let disposal = colony.layout().disposal_cell();
        let start = Pos::new(disposal.x - 1, disposal.y);
        let red_waste = colony.spawn_waste(Tier::Red, start);
        let red = colony.spawn_robot(Tier::Red, start);
        colony.apply(red, Action::PickUp(red_waste));
        assert!(!colony.is_complete(), "a carried red item is in flight");
    }

    #[test]
    fn seeded_colonies_evolve_identically() {
        let config = ColonyConfig {
            rng_seed: Some(0xDEAD_BEEF),
            ..ColonyConfig::default()
        };
        let mut a = Colony::new(config.clone()).expect("colony a");
        let mut b = Colony::new(config).expect("colony b");
        for _ in 0..40 {
            a.step();
            b.step();
        }
        assert_eq!(a.snapshot(), b.snapshot());
        assert_eq!(a.messages_sent(), b.messages_sent());

        let mut c = Colony::new(ColonyConfig {
            rng_seed: Some(0xF00D),
            ..ColonyConfig::default()
        })
        .expect("colony c");
        for _ in 0..40 {
            c.step();
        }
        assert_ne!(
            a.snapshot(),
            c.snapshot(),
            "different seeds should diverge"
        );
    }

    #[test]
    fn observer_receives_stats_every_tick() {
        use std::sync::{Arc, Mutex};

        #[derive(Default)]
        struct SpyObserver {
            seen: Arc<Mutex<Vec<TickStats>>>,
        }
        impl RunObserver for SpyObserver {
            fn on_tick(&mut self, stats: &TickStats) {
                self.seen.lock().unwrap().push(stats.clone());
            }
        }

        let spy = SpyObserver::default();
        let seen = spy.seen.clone();
        let config = ColonyConfig {
            rng_seed: Some(9),
            ..ColonyConfig::default()
        };
        let mut colony = Colony::with_observer(config, Box::new(spy)).expect("colony");
        colony.step();
        colony.step();

        let entries = seen.lock().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].tick, Tick(1));
        assert_eq!(entries[1].tick, Tick(2));
        assert_eq!(entries[0].on_grid.total() + entries[0].carried, 20);
    }
}
