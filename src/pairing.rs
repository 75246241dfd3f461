//! Nearest-helmet pairing.
//!
//! Every `driver` box is compared against every `helmet` box. A driver whose
//! nearest helmet center lies strictly closer than `MATCH_RADIUS` is
//! considered helmeted; all other drivers are violation candidates.
//!
//! A helmet may be the nearest one for several drivers at once. There is no
//! one-to-one assignment.

use crate::detect::BoundingBox;

/// Distance in pixels below which a helmet belongs to a driver.
pub const MATCH_RADIUS: f64 = 200.0;

/// A driver without a qualifying helmet.
#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    /// Position of the driver in the detection list.
    pub index: usize,
    pub driver: BoundingBox,
}

/// Distance from `driver` to the nearest helmet, if any helmet exists.
pub fn nearest_helmet_distance<'a, I>(driver: &BoundingBox, helmets: I) -> Option<f64>
where
    I: IntoIterator<Item = &'a BoundingBox>,
{
    helmets
        .into_iter()
        .map(|helmet| driver.center_distance(helmet))
        .min_by(|a, b| a.total_cmp(b))
}

/// Return the unmatched drivers in detection order.
pub fn pair(boxes: &[BoundingBox]) -> Vec<Candidate> {
    let helmets: Vec<&BoundingBox> = boxes.iter().filter(|b| b.is_helmet()).collect();

    boxes
        .iter()
        .enumerate()
        .filter(|(_, b)| b.is_driver())
        .filter(|(_, driver)| {
            match nearest_helmet_distance(driver, helmets.iter().copied()) {
                Some(distance) => distance >= MATCH_RADIUS,
                None => true,
            }
        })
        .map(|(index, driver)| Candidate {
            index,
            driver: driver.clone(),
        })
        .collect()
}
