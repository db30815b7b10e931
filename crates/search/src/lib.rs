mod cache;
mod ranker;
mod search;
mod similar;

pub use cache::QueryCache;
pub use ranker::{RankedHit, RankingWeights, keyword_score, rank};
pub use search::{SearchError, SearchParams, search};
pub use similar::{SimilarHit, SimilarParams, search_similar};
