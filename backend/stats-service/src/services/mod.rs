pub mod averages;

pub use averages::StatsQuery;
