//! Index-only reordering shared by the city list and the detail-view
//! section order.

/// Move the element at `from` to `to`, shifting everything in between by one.
///
/// `to` is clamped to the last index. Returns the final index, or `None` when
/// `from` is out of range.
pub fn move_item<T>(items: &mut Vec<T>, from: usize, to: usize) -> Option<usize> {
    if from >= items.len() {
        return None;
    }

    let to = to.min(items.len() - 1);
    if from != to {
        let item = items.remove(from);
        items.insert(to, item);
    }
    Some(to)
}

pub fn can_move_up(index: usize) -> bool {
    index > 0
}

pub fn can_move_down(index: usize, len: usize) -> bool {
    index + 1 < len
}
