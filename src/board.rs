//! Pure board operations.
//!
//! Every function takes a snapshot by reference and returns a new one; the
//! input is never mutated, so a snapshot handed to a pending sync request stays
//! exactly what was sent.

use crate::model::{
    Board, Container, ContainerOrder, DropTarget, Item, ItemPosition, ItemsOrder,
    CONTAINER_ID_PREFIX, ITEM_ID_PREFIX,
};
use rand::Rng;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BoardError {
    #[error("unknown item: {0}")]
    UnknownItem(String),
    #[error("unknown container: {0}")]
    UnknownContainer(String),
    #[error("title must not be empty")]
    EmptyTitle,
}

/// Index of the container holding `item_id`.
pub fn find_item_container(board: &Board, item_id: &str) -> Option<usize> {
    board
        .containers
        .iter()
        .position(|c| c.items.iter().any(|i| i.id == item_id))
}

pub fn container_index(board: &Board, container_id: &str) -> Option<usize> {
    board.containers.iter().position(|c| c.id == container_id)
}

/// Move element `from` of `src` to index `to` of `dst`.
///
/// `to` is clamped to the destination length after removal. Out-of-range
/// `from` leaves both sequences unchanged.
pub fn move_element<T: Clone>(src: &[T], from: usize, dst: &[T], to: usize) -> (Vec<T>, Vec<T>) {
    let mut src = src.to_vec();
    let mut dst = dst.to_vec();
    if from >= src.len() {
        return (src, dst);
    }
    let moved = src.remove(from);
    let to = to.min(dst.len());
    dst.insert(to, moved);
    (src, dst)
}

/// Move element `from` to index `to` within one sequence.
pub fn array_move<T: Clone>(seq: &[T], from: usize, to: usize) -> Vec<T> {
    let mut out = seq.to_vec();
    if from >= out.len() {
        return out;
    }
    let moved = out.remove(from);
    let to = to.min(out.len());
    out.insert(to, moved);
    out
}

/// Resolve a drag of `active` over `over` into a new board.
pub fn apply_drag_move(board: &Board, active: &str, over: &DropTarget) -> Result<Board, BoardError> {
    if active == over.id() {
        return Ok(board.clone());
    }
    let from_c = find_item_container(board, active)
        .ok_or_else(|| BoardError::UnknownItem(active.to_string()))?;
    let from_i = board.containers[from_c]
        .items
        .iter()
        .position(|i| i.id == active)
        .ok_or_else(|| BoardError::UnknownItem(active.to_string()))?;

    let (to_c, to_i) = match over {
        DropTarget::Item(over_id) => {
            let to_c = find_item_container(board, over_id)
                .ok_or_else(|| BoardError::UnknownItem(over_id.clone()))?;
            let to_i = board.containers[to_c]
                .items
                .iter()
                .position(|i| &i.id == over_id)
                .ok_or_else(|| BoardError::UnknownItem(over_id.clone()))?;
            (to_c, to_i)
        }
        DropTarget::Container(container_id) => {
            let to_c = container_index(board, container_id)
                .ok_or_else(|| BoardError::UnknownContainer(container_id.clone()))?;
            (to_c, board.containers[to_c].items.len())
        }
    };

    let mut next = board.clone();
    if from_c == to_c {
        next.containers[from_c].items = array_move(&board.containers[from_c].items, from_i, to_i);
    } else {
        let (src, dst) = move_element(
            &board.containers[from_c].items,
            from_i,
            &board.containers[to_c].items,
            to_i,
        );
        next.containers[from_c].items = src;
        next.containers[to_c].items = dst;
    }
    Ok(normalize_positions(&next))
}

/// Reassign `position` of every container and item to its current index.
pub fn normalize_positions(board: &Board) -> Board {
    let mut next = board.clone();
    for (ci, container) in next.containers.iter_mut().enumerate() {
        container.position = ci;
        for (ii, item) in container.items.iter_mut().enumerate() {
            item.position = ii;
        }
    }
    next
}

/// Payload describing item order per container, positions taken from indices.
pub fn items_order(board: &Board) -> ItemsOrder {
    ItemsOrder {
        containers: board
            .containers
            .iter()
            .map(|c| ContainerOrder {
                id: c.id.clone(),
                items: c
                    .items
                    .iter()
                    .enumerate()
                    .map(|(position, i)| ItemPosition {
                        id: i.id.clone(),
                        position,
                    })
                    .collect(),
            })
            .collect(),
    }
}

fn gen_id(prefix: &str) -> String {
    format!("{prefix}{:016x}", rand::thread_rng().gen::<u64>())
}

/// Append a new container. Returns the new board and the generated id.
pub fn add_container(board: &Board, title: &str, description: &str) -> Result<(Board, String), BoardError> {
    let title = title.trim();
    if title.is_empty() {
        return Err(BoardError::EmptyTitle);
    }
    let id = gen_id(CONTAINER_ID_PREFIX);
    let mut next = board.clone();
    next.containers.push(Container {
        id: id.clone(),
        title: title.to_string(),
        description: description.to_string(),
        position: next.containers.len(),
        items: Vec::new(),
    });
    Ok((next, id))
}

/// Append a new item to `container_id`. Returns the new board and the generated id.
pub fn add_item(board: &Board, container_id: &str, title: &str) -> Result<(Board, String), BoardError> {
    let title = title.trim();
    if title.is_empty() {
        return Err(BoardError::EmptyTitle);
    }
    let ci = container_index(board, container_id)
        .ok_or_else(|| BoardError::UnknownContainer(container_id.to_string()))?;
    let id = gen_id(ITEM_ID_PREFIX);
    let mut next = board.clone();
    let items = &mut next.containers[ci].items;
    items.push(Item {
        id: id.clone(),
        title: title.to_string(),
        position: items.len(),
    });
    Ok((next, id))
}

/// Title of an item, or an empty string when it is not on the board.
pub fn item_title<'a>(board: &'a Board, item_id: &str) -> &'a str {
    board
        .containers
        .iter()
        .flat_map(|c| c.items.iter())
        .find(|i| i.id == item_id)
        .map(|i| i.title.as_str())
        .unwrap_or("")
}
