//! Placement commands that reference already-transmitted image data.

/// A placement anchored to another (parent) placement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelativePlacement {
    pub image_id: u32,
    pub placement_id: u32,
    pub parent_image_id: u32,
    pub parent_placement_id: u32,
    pub columns: u32,
    pub rows: u32,
    /// Horizontal offset from the parent, in cells.
    pub dx: i32,
    /// Vertical offset from the parent, in cells.
    pub dy: i32,
}

/// Body of an `a=p,U=1` command: a virtual placement addressed through a
/// placeholder grid, created without resending data.
pub fn virtual_placement_body(
    image_id: u32,
    placement_id: u32,
    columns: u32,
    rows: u32,
    quiet: bool,
) -> String {
    let mut args = vec!["a=p".to_string(), "U=1".to_string()];
    if quiet {
        args.push("q=2".to_string());
    }
    if image_id != 0 {
        args.push(format!("i={image_id}"));
    }
    if placement_id != 0 {
        args.push(format!("p={placement_id}"));
    }
    if columns > 0 {
        args.push(format!("c={columns}"));
    }
    if rows > 0 {
        args.push(format!("r={rows}"));
    }
    args.join(",")
}

/// Body of an `a=p` command tied to a parent placement (`P`/`Q`) with
/// optional cell offsets (`H`/`V`). Errors are reported (`q=1`).
pub fn relative_placement_body(p: &RelativePlacement) -> String {
    let mut args = vec![
        "a=p".to_string(),
        "q=1".to_string(),
        format!("i={}", p.image_id),
        format!("p={}", p.placement_id),
        format!("P={}", p.parent_image_id),
        format!("Q={}", p.parent_placement_id),
    ];
    if p.columns > 0 {
        args.push(format!("c={}", p.columns));
    }
    if p.rows > 0 {
        args.push(format!("r={}", p.rows));
    }
    if p.dx != 0 {
        args.push(format!("H={}", p.dx));
    }
    if p.dy != 0 {
        args.push(format!("V={}", p.dy));
    }
    args.join(",")
}

/// Body of a command deleting every image and its data (`a=d,d=A`).
pub fn delete_all_body(quiet: bool) -> String {
    format!("a=d,d=A,q={}", if quiet { 2 } else { 1 })
}
