use rand::Rng;
use tracing::debug;

use murmur_shared::types::TempId;

/// Draw a fixed-length numeric temp id, retrying while `taken` reports a
/// collision.
pub fn generate_temp_id<R, F>(rng: &mut R, taken: F) -> TempId
where
    R: Rng + ?Sized,
    F: Fn(TempId) -> bool,
{
    loop {
        let candidate = TempId(rng.gen_range(TempId::MIN..TempId::MAX_EXCLUSIVE));
        if !taken(candidate) {
            return candidate;
        }
        debug!(temp_id = %candidate, "Temp id collision, drawing again");
    }
}
