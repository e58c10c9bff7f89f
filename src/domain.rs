//! Domain module - incidents, alliance presence and live events
//!
//! Each module is its own file in the domain/ directory; the commonly used
//! types are re-exported here for convenience.

pub mod alliance;
pub mod change_set;
pub mod events;
pub mod incident;

pub use alliance::{
    AllianceMember, AllianceStat, MemberActivity, MemberCounts, MemberExclusions, NewAllianceStat,
    ObservedMember, StatDelta,
};
pub use change_set::ChangeSet;
pub use events::{IncidentAction, LiveEvent};
pub use incident::{
    Coordinates, ExtractedIncident, Incident, IncidentCategory, IncidentSource, IncidentStatus,
    ListContext, PageDetails,
};
