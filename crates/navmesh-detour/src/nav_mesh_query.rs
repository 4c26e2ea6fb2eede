//! Path and surface queries over a [`NavMesh`]
//!
//! A [`NavMeshQuery`] borrows the mesh for the duration of the queries it runs.
//! Which polygons may be crossed is decided by a [`QueryFilter`], which also
//! weighs every area when searching for paths.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

use glam::Vec3;

use super::nav_mesh::{
    closest_point_on_polygon, point_in_polygon_xz, polygon_height, MeshTile, Poly,
};
use super::{NavMesh, PolyFlags, PolyRef, PolyType, Status};
use navmesh_common::{Error, Result};

/// Number of area ids a filter can weigh
pub const MAX_AREAS: usize = 64;

/// Maximum number of nodes a search expands
const MAX_NODES: usize = 4096;

/// Maximum number of nodes explored when moving along the surface
const MAX_SURFACE_NODES: usize = 48;

/// Maximum number of polygons a single raycast walks through
const MAX_RAYCAST_STEPS: usize = 256;

/// Scale of the path heuristic, slightly below one to favour expanded nodes
const H_SCALE: f32 = 0.999;

const EPS: f32 = 1e-6;

/// Decides which polygons a query may visit and what crossing an area costs
#[derive(Debug, Clone, PartialEq)]
pub struct QueryFilter {
    /// A polygon needs at least one of these flags
    pub include_flags: PolyFlags,
    /// A polygon with any of these flags is skipped
    pub exclude_flags: PolyFlags,
    area_cost: [f32; MAX_AREAS],
}

impl Default for QueryFilter {
    fn default() -> Self {
        Self {
            include_flags: PolyFlags::ALL,
            exclude_flags: PolyFlags::empty(),
            area_cost: [1.0; MAX_AREAS],
        }
    }
}

impl QueryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cost multiplier of `area`. Ids outside the table cost 1.
    pub fn area_cost(&self, area: u8) -> f32 {
        self.area_cost.get(area as usize).copied().unwrap_or(1.0)
    }

    /// Sets the cost multiplier of `area`. Ids outside the table are ignored.
    pub fn set_area_cost(&mut self, area: u8, cost: f32) {
        match self.area_cost.get_mut(area as usize) {
            Some(slot) => *slot = cost,
            None => log::warn!("Area id {} is out of range, cost ignored", area),
        }
    }

    /// Whether a query may visit `poly`
    pub fn pass_filter(&self, poly: &Poly) -> bool {
        poly.flags.intersects(self.include_flags) && !poly.flags.intersects(self.exclude_flags)
    }
}

bitflags::bitflags! {
    /// Role of a point in a straight path
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(
        feature = "serialization",
        derive(serde::Serialize, serde::Deserialize)
    )]
    pub struct StraightPathFlags: u8 {
        /// First point of the path
        const START = 0x01;
        /// Last point of the path
        const END = 0x02;
        /// The point enters an off-mesh connection
        const OFF_MESH_CONNECTION = 0x04;
    }
}

/// Corner of a straight path
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StraightPathPoint {
    pub position: Vec3,
    pub flags: StraightPathFlags,
    /// Polygon the path continues on from this point
    pub poly: PolyRef,
}

/// Result of [`NavMeshQuery::raycast`]
#[derive(Debug, Clone, PartialEq)]
pub struct RaycastHit {
    /// Fraction of the segment travelled before the wall, `f32::MAX` without a hit
    pub t: f32,
    /// Normal of the wall that was hit
    pub normal: Vec3,
    /// Polygons visited by the ray
    pub path: Vec<PolyRef>,
}

impl RaycastHit {
    pub fn is_hit(&self) -> bool {
        self.t < f32::MAX
    }
}

/// Nearest wall found by [`NavMeshQuery::find_distance_to_wall`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WallHit {
    pub distance: f32,
    pub position: Vec3,
    /// Points from the wall towards the query center
    pub normal: Vec3,
}

/// Search node of [`NavMeshQuery::find_path`]
#[derive(Debug, Clone)]
struct Node {
    poly: PolyRef,
    parent: Option<usize>,
    pos: Vec3,
    cost: f32,
    total: f32,
    closed: bool,
}

/// Open list entry, ordered so the heap pops the lowest total first
#[derive(Debug, Clone, Copy)]
struct HeapNode {
    index: usize,
    total: f32,
}

impl PartialEq for HeapNode {
    fn eq(&self, other: &Self) -> bool {
        self.total == other.total
    }
}

impl Eq for HeapNode {}

impl PartialOrd for HeapNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapNode {
    fn cmp(&self, other: &Self) -> Ordering {
        other.total.total_cmp(&self.total)
    }
}

/// Queries over a borrowed navigation mesh
#[derive(Debug)]
pub struct NavMeshQuery<'a> {
    nav_mesh: &'a NavMesh,
    random_seed: u32,
}

impl<'a> NavMeshQuery<'a> {
    pub fn new(nav_mesh: &'a NavMesh) -> Self {
        Self {
            nav_mesh,
            random_seed: 1,
        }
    }

    /// Starts the random sequence used by the random point queries at `seed`
    pub fn with_random_seed(mut self, seed: u32) -> Self {
        self.random_seed = seed;
        self
    }

    /// Current state of the random sequence
    pub fn random_seed(&self) -> u32 {
        self.random_seed
    }

    pub fn nav_mesh(&self) -> &'a NavMesh {
        self.nav_mesh
    }

    fn next_random(&mut self) -> u32 {
        self.random_seed = self
            .random_seed
            .wrapping_mul(1103515245)
            .wrapping_add(12345);
        self.random_seed
    }

    /// Random float in `[0, 1]`
    fn random_f32(&mut self) -> f32 {
        (self.next_random() & 0x7FFFFFFF) as f32 / 2147483647.0
    }

    fn poly_index(&self, reference: PolyRef) -> usize {
        self.nav_mesh.decode_poly_ref(reference).2 as usize
    }

    /// Finds the polygon passing `filter` nearest to `center` within the box.
    ///
    /// Returns the polygon and the closest point on it.
    pub fn find_nearest_poly(
        &self,
        center: Vec3,
        half_extents: Vec3,
        filter: &QueryFilter,
    ) -> Option<(PolyRef, Vec3)> {
        let mut best: Option<(PolyRef, Vec3, f32)> = None;
        for reference in self.nav_mesh.query_polygons(center, half_extents) {
            let Ok((tile, poly)) = self.nav_mesh.get_tile_and_poly_by_ref(reference) else {
                continue;
            };
            if !filter.pass_filter(poly) {
                continue;
            }
            let point = closest_point_on_polygon(&tile.poly_verts(poly), center);
            let d = point.distance_squared(center);
            if best.map_or(true, |(_, _, bd)| d < bd) {
                best = Some((reference, point, d));
            }
        }
        best.map(|(reference, point, _)| (reference, point))
    }

    /// Finds a polygon corridor from `start_ref` to `end_ref` with A*.
    ///
    /// Nodes sit on the midpoints of the portals between polygons and the cost of a
    /// step is its length weighed by the area of the polygon it crosses. When the
    /// end cannot be reached the corridor leads to the polygon closest to it.
    pub fn find_path(
        &self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
    ) -> Result<Vec<PolyRef>> {
        if !self.nav_mesh.is_valid_poly_ref(start_ref) || !self.nav_mesh.is_valid_poly_ref(end_ref) {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }
        if start_ref == end_ref {
            return Ok(vec![start_ref]);
        }

        let start_h = start_pos.distance(end_pos) * H_SCALE;
        let mut nodes = vec![Node {
            poly: start_ref,
            parent: None,
            pos: start_pos,
            cost: 0.0,
            total: start_h,
            closed: false,
        }];
        let mut lookup = HashMap::from([(start_ref, 0usize)]);
        let mut open = BinaryHeap::from([HeapNode {
            index: 0,
            total: start_h,
        }]);
        let mut best = 0;
        let mut best_h = start_h;
        let mut out_of_nodes = false;

        while let Some(HeapNode { index, total }) = open.pop() {
            // Entries superseded by a cheaper route
            if nodes[index].closed || total > nodes[index].total {
                continue;
            }
            nodes[index].closed = true;

            let current = nodes[index].poly;
            if current == end_ref {
                best = index;
                break;
            }

            let (tile, poly) = self.nav_mesh.get_tile_and_poly_by_ref(current)?;
            let parent = nodes[index].parent.map(|p| nodes[p].poly);
            let area_cost = filter.area_cost(poly.area);

            for link in tile.poly_links(self.poly_index(current)) {
                let neighbor = link.reference;
                if Some(neighbor) == parent {
                    continue;
                }
                let Ok((_, neighbor_poly)) = self.nav_mesh.get_tile_and_poly_by_ref(neighbor) else {
                    continue;
                };
                if !filter.pass_filter(neighbor_poly) {
                    continue;
                }
                let Some((a, b)) = self.portal_points(current, neighbor) else {
                    continue;
                };

                let pos = (a + b) * 0.5;
                let mut cost = nodes[index].cost + nodes[index].pos.distance(pos) * area_cost;
                let h = if neighbor == end_ref {
                    cost += pos.distance(end_pos) * filter.area_cost(neighbor_poly.area);
                    0.0
                } else {
                    pos.distance(end_pos) * H_SCALE
                };
                let total = cost + h;

                let node = Node {
                    poly: neighbor,
                    parent: Some(index),
                    pos,
                    cost,
                    total,
                    closed: false,
                };
                let neighbor_index = match lookup.get(&neighbor) {
                    Some(&existing) => {
                        if total >= nodes[existing].total {
                            continue;
                        }
                        nodes[existing] = node;
                        existing
                    }
                    None => {
                        if nodes.len() >= MAX_NODES {
                            out_of_nodes = true;
                            continue;
                        }
                        nodes.push(node);
                        lookup.insert(neighbor, nodes.len() - 1);
                        nodes.len() - 1
                    }
                };
                open.push(HeapNode {
                    index: neighbor_index,
                    total,
                });

                if h < best_h {
                    best_h = h;
                    best = neighbor_index;
                }
            }
        }

        if out_of_nodes {
            log::debug!("Path search ran out of nodes");
        }

        let mut path = Vec::new();
        let mut cursor = Some(best);
        while let Some(i) = cursor {
            if path.len() > nodes.len() {
                return Err(Error::Detour(Status::Failure.to_string()));
            }
            path.push(nodes[i].poly);
            cursor = nodes[i].parent;
        }
        path.reverse();
        Ok(path)
    }

    /// Turns a polygon corridor into the corners of the shortest path along it.
    ///
    /// The corridor is pulled taut between off-mesh connections. Each connection
    /// adds its entry point, flagged [`StraightPathFlags::OFF_MESH_CONNECTION`], and
    /// its landing point.
    pub fn find_straight_path(
        &self,
        start_pos: Vec3,
        end_pos: Vec3,
        path: &[PolyRef],
    ) -> Result<Vec<StraightPathPoint>> {
        let (Some(&first), Some(&last)) = (path.first(), path.last()) else {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        };
        let start = self.nav_mesh.closest_point_on_poly(first, start_pos)?;
        let end = self.nav_mesh.closest_point_on_poly(last, end_pos)?;

        let mut points = Vec::new();
        push_point(&mut points, start, StraightPathFlags::START, first);

        let mut segment_start = start;
        let mut segment_first = 0;
        for i in 1..path.len().saturating_sub(1) {
            let (_, poly) = self.nav_mesh.get_tile_and_poly_by_ref(path[i])?;
            if poly.poly_type != PolyType::OffMeshConnection {
                continue;
            }
            let (entry, _) = self.portal_points(path[i - 1], path[i]).ok_or_else(broken_path)?;
            let (landing, _) = self.portal_points(path[i], path[i + 1]).ok_or_else(broken_path)?;

            self.pull_corridor(segment_start, entry, &path[segment_first..i], &mut points)?;
            push_point(&mut points, entry, StraightPathFlags::OFF_MESH_CONNECTION, path[i]);
            push_point(&mut points, landing, StraightPathFlags::empty(), path[i + 1]);
            segment_start = landing;
            segment_first = i + 1;
        }

        self.pull_corridor(segment_start, end, &path[segment_first..], &mut points)?;
        push_point(&mut points, end, StraightPathFlags::END, last);
        Ok(points)
    }

    /// Appends the corners of the taut path from `start` to `end` through
    /// `corridor`, excluding both ends
    fn pull_corridor(
        &self,
        start: Vec3,
        end: Vec3,
        corridor: &[PolyRef],
        points: &mut Vec<StraightPathPoint>,
    ) -> Result<()> {
        let (Some(&first), Some(&last)) = (corridor.first(), corridor.last()) else {
            return Ok(());
        };

        // (left, right, polygon entered through the portal)
        let mut portals = Vec::with_capacity(corridor.len() + 1);
        portals.push((start, start, first));
        for pair in corridor.windows(2) {
            let (a, b) = self.portal_points(pair[0], pair[1]).ok_or_else(broken_path)?;
            let center = self.poly_center(pair[0])?;
            let mid = (a + b) * 0.5;
            if cross_xz(mid - center, a - mid) > 0.0 {
                portals.push((a, b, pair[1]));
            } else {
                portals.push((b, a, pair[1]));
            }
        }
        portals.push((end, end, last));

        let (mut apex, mut left, mut right) = (start, start, start);
        let (mut apex_index, mut left_index, mut right_index) = (0, 0, 0);
        let mut i = 1;
        while i < portals.len() {
            let (portal_left, portal_right, _) = portals[i];

            if tri_area_xz(apex, right, portal_right) >= 0.0 {
                if same_xz(apex, right) || tri_area_xz(apex, left, portal_right) < 0.0 {
                    right = portal_right;
                    right_index = i;
                } else if left_index > apex_index {
                    // Right crossed over left: left becomes a corner
                    apex = left;
                    apex_index = left_index;
                    push_point(points, apex, StraightPathFlags::empty(), portals[apex_index].2);
                    right = apex;
                    right_index = apex_index;
                    i = apex_index + 1;
                    continue;
                } else {
                    right = portal_right;
                    right_index = i;
                }
            }

            if tri_area_xz(apex, left, portal_left) <= 0.0 {
                if same_xz(apex, left) || tri_area_xz(apex, right, portal_left) > 0.0 {
                    left = portal_left;
                    left_index = i;
                } else if right_index > apex_index {
                    apex = right;
                    apex_index = right_index;
                    push_point(points, apex, StraightPathFlags::empty(), portals[apex_index].2);
                    left = apex;
                    left_index = apex_index;
                    i = apex_index + 1;
                    continue;
                } else {
                    left = portal_left;
                    left_index = i;
                }
            }

            i += 1;
        }
        Ok(())
    }

    /// End points of the portal from `from` into `to`.
    ///
    /// Border portals are clipped to the part both edges share. Portals into or out
    /// of an off-mesh connection collapse to the connection end point.
    fn portal_points(&self, from: PolyRef, to: PolyRef) -> Option<(Vec3, Vec3)> {
        let (from_tile, from_poly) = self.nav_mesh.get_tile_and_poly_by_ref(from).ok()?;
        let (to_tile, to_poly) = self.nav_mesh.get_tile_and_poly_by_ref(to).ok()?;
        let from_index = self.poly_index(from);
        let to_index = self.poly_index(to);

        if from_poly.poly_type == PolyType::OffMeshConnection {
            let link = from_tile.poly_links(from_index).find(|l| l.reference == to)?;
            let v = from_tile.vert(from_poly.verts[(link.edge_index as usize).min(1)]);
            return Some((v, v));
        }
        if to_poly.poly_type == PolyType::OffMeshConnection {
            let link = to_tile.poly_links(to_index).find(|l| l.reference == from)?;
            let v = to_tile.vert(to_poly.verts[(link.edge_index as usize).min(1)]);
            return Some((v, v));
        }

        let link = from_tile.poly_links(from_index).find(|l| l.reference == to)?;
        let (a, b) = poly_edge(from_tile, from_poly, link.edge_index as usize)?;
        if !link.crosses_tile_border() {
            return Some((a, b));
        }

        let back = to_tile
            .poly_links(to_index)
            .find(|l| l.reference == from && l.crosses_tile_border())?;
        let (na, nb) = poly_edge(to_tile, to_poly, back.edge_index as usize)?;
        let along_x = link.side & 1 == 1;
        let coord = |v: Vec3| if along_x { v.x } else { v.z };
        let (lo, hi) = (coord(na).min(coord(nb)), coord(na).max(coord(nb)));
        let clip = |v: Vec3| {
            let span = coord(b) - coord(a);
            if span.abs() < EPS {
                return v;
            }
            let t = (coord(v).clamp(lo, hi) - coord(a)) / span;
            a.lerp(b, t.clamp(0.0, 1.0))
        };
        Some((clip(a), clip(b)))
    }

    fn poly_center(&self, reference: PolyRef) -> Result<Vec3> {
        let (tile, poly) = self.nav_mesh.get_tile_and_poly_by_ref(reference)?;
        let verts = tile.poly_verts(poly);
        Ok(verts.iter().copied().sum::<Vec3>() / verts.len().max(1) as f32)
    }

    /// Moves from `start` towards `end` while staying on the surface.
    ///
    /// Returns where the movement stopped and the polygons crossed on the way,
    /// at most `max_visited` of them.
    pub fn move_along_surface(
        &self,
        start_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
        max_visited: usize,
    ) -> Result<(Vec3, Vec<PolyRef>)> {
        if !self.nav_mesh.is_valid_poly_ref(start_ref) {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }

        let search_pos = start_pos.lerp(end_pos, 0.5);
        let search_rad_sqr = (start_pos.distance(end_pos) * 0.5 + 0.001).powi(2);

        // (polygon, parent node)
        let mut nodes: Vec<(PolyRef, Option<usize>)> = vec![(start_ref, None)];
        let mut visited = HashSet::from([start_ref]);
        let mut queue = VecDeque::from([0usize]);

        let mut best_pos = start_pos;
        let mut best_dist = f32::MAX;
        let mut best_node = 0;

        while let Some(current) = queue.pop_front() {
            let reference = nodes[current].0;
            let (tile, poly) = self.nav_mesh.get_tile_and_poly_by_ref(reference)?;
            let verts = tile.poly_verts(poly);

            if point_in_polygon_xz(end_pos, &verts) {
                best_node = current;
                best_pos = end_pos;
                break;
            }

            let poly_index = self.poly_index(reference);
            for j in 0..verts.len() {
                let a = verts[j];
                let b = verts[(j + 1) % verts.len()];
                let neighbors: Vec<PolyRef> = tile
                    .poly_links(poly_index)
                    .filter(|l| l.edge_index as usize == j)
                    .map(|l| l.reference)
                    .filter(|&r| {
                        self.nav_mesh
                            .get_tile_and_poly_by_ref(r)
                            .is_ok_and(|(_, p)| filter.pass_filter(p))
                    })
                    .collect();

                if neighbors.is_empty() {
                    // Wall edge: remember the closest point on it
                    let (d, t) = dist_point_segment_sqr_xz(end_pos, a, b);
                    if d < best_dist {
                        best_pos = a.lerp(b, t);
                        best_dist = d;
                        best_node = current;
                    }
                    continue;
                }

                if dist_point_segment_sqr_xz(search_pos, a, b).0 > search_rad_sqr {
                    continue;
                }
                for neighbor in neighbors {
                    if nodes.len() >= MAX_SURFACE_NODES || !visited.insert(neighbor) {
                        continue;
                    }
                    nodes.push((neighbor, Some(current)));
                    queue.push_back(nodes.len() - 1);
                }
            }
        }

        let mut visited_path = Vec::new();
        let mut cursor = Some(best_node);
        while let Some(i) = cursor {
            visited_path.push(nodes[i].0);
            cursor = nodes[i].1;
        }
        visited_path.reverse();
        visited_path.truncate(max_visited.max(1));

        let (tile, poly) = self.nav_mesh.get_tile_and_poly_by_ref(nodes[best_node].0)?;
        if let Some(y) = polygon_height(&tile.poly_verts(poly), best_pos) {
            best_pos.y = y;
        }
        Ok((best_pos, visited_path))
    }

    /// Casts a ray along the surface from `start_pos` towards `end_pos`.
    ///
    /// The ray follows the polygons it crosses and stops at the first edge it cannot
    /// pass. Heights are ignored.
    pub fn raycast(
        &self,
        start_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
    ) -> Result<RaycastHit> {
        if !self.nav_mesh.is_valid_poly_ref(start_ref) {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }

        let mut hit = RaycastHit {
            t: 0.0,
            normal: Vec3::ZERO,
            path: Vec::new(),
        };
        let mut current = start_ref;

        for _ in 0..MAX_RAYCAST_STEPS {
            let (tile, poly) = self.nav_mesh.get_tile_and_poly_by_ref(current)?;
            let verts = tile.poly_verts(poly);
            let Some((_, tmax, exit_edge)) = intersect_segment_poly_xz(start_pos, end_pos, &verts)
            else {
                // The ray starts outside the polygon
                return Ok(hit);
            };
            hit.path.push(current);
            hit.t = hit.t.max(tmax);

            let Some(edge) = exit_edge else {
                hit.t = f32::MAX;
                return Ok(hit);
            };

            let exit_point = start_pos.lerp(end_pos, tmax);
            let next = tile
                .poly_links(self.poly_index(current))
                .filter(|l| l.edge_index as usize == edge)
                .find(|l| {
                    let Ok((_, next_poly)) = self.nav_mesh.get_tile_and_poly_by_ref(l.reference)
                    else {
                        return false;
                    };
                    if next_poly.poly_type != PolyType::Ground || !filter.pass_filter(next_poly) {
                        return false;
                    }
                    if !l.crosses_tile_border() {
                        return true;
                    }
                    self.portal_points(current, l.reference).is_some_and(|(a, b)| {
                        dist_point_segment_sqr_xz(exit_point, a, b).0 < 1e-4
                    })
                })
                .map(|l| l.reference);

            match next {
                Some(reference) => current = reference,
                None => {
                    let a = verts[edge];
                    let b = verts[(edge + 1) % verts.len()];
                    hit.normal = Vec3::new(b.z - a.z, 0.0, -(b.x - a.x)).normalize_or_zero();
                    return Ok(hit);
                }
            }
        }

        log::debug!("Raycast stopped after {} polygons", MAX_RAYCAST_STEPS);
        Ok(hit)
    }

    /// Picks a random point on the mesh, each polygon weighed by its area
    pub fn find_random_point(&mut self, filter: &QueryFilter) -> Option<(PolyRef, Vec3)> {
        let nav_mesh = self.nav_mesh;
        let mut chosen = None;
        let mut area_sum = 0.0;
        for tile in nav_mesh.tiles() {
            let Some(header) = tile.header.as_ref() else {
                continue;
            };
            let Some(base) = nav_mesh.get_tile_ref_at(header.x, header.y, header.layer) else {
                continue;
            };
            let (salt, tile_index, _) = nav_mesh.decode_poly_ref(base);
            for (pi, poly) in tile.polys.iter().enumerate() {
                if poly.poly_type != PolyType::Ground || !filter.pass_filter(poly) {
                    continue;
                }
                let area = polygon_area_xz(&tile.poly_verts(poly));
                area_sum += area;
                if self.random_f32() * area_sum <= area {
                    chosen = Some(nav_mesh.encode_poly_ref(salt, tile_index, pi as u32));
                }
            }
        }

        let reference = chosen?;
        let (tile, poly) = nav_mesh.get_tile_and_poly_by_ref(reference).ok()?;
        let point = self.random_point_in_polygon(&tile.poly_verts(poly));
        Some((reference, point))
    }

    /// Picks a random point on the polygons reachable from `start_ref` within
    /// `radius` of `center`.
    ///
    /// Returns `None` when no ground polygon is reachable.
    pub fn find_random_point_around_circle(
        &mut self,
        start_ref: PolyRef,
        center: Vec3,
        radius: f32,
        filter: &QueryFilter,
    ) -> Result<Option<(PolyRef, Vec3)>> {
        let nav_mesh = self.nav_mesh;
        let (_, start_poly) = nav_mesh.get_tile_and_poly_by_ref(start_ref)?;
        if !filter.pass_filter(start_poly) || radius < 0.0 {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }

        let radius_sqr = radius * radius;
        let mut visited = HashSet::from([start_ref]);
        let mut queue = VecDeque::from([start_ref]);
        let mut chosen = None;
        let mut area_sum = 0.0;

        while let Some(current) = queue.pop_front() {
            let (tile, poly) = nav_mesh.get_tile_and_poly_by_ref(current)?;
            if poly.poly_type == PolyType::Ground {
                let area = polygon_area_xz(&tile.poly_verts(poly));
                area_sum += area;
                if self.random_f32() * area_sum <= area {
                    chosen = Some(current);
                }
            }

            for link in tile.poly_links(self.poly_index(current)) {
                let neighbor = link.reference;
                if visited.contains(&neighbor) || visited.len() >= MAX_NODES {
                    continue;
                }
                let Ok((_, neighbor_poly)) = nav_mesh.get_tile_and_poly_by_ref(neighbor) else {
                    continue;
                };
                if !filter.pass_filter(neighbor_poly) {
                    continue;
                }
                let Some((a, b)) = self.portal_points(current, neighbor) else {
                    continue;
                };
                if dist_point_segment_sqr_xz(center, a, b).0 > radius_sqr {
                    continue;
                }
                visited.insert(neighbor);
                queue.push_back(neighbor);
            }
        }

        let Some(reference) = chosen else {
            return Ok(None);
        };
        let (tile, poly) = nav_mesh.get_tile_and_poly_by_ref(reference)?;
        let verts = tile.poly_verts(poly);
        for _ in 0..16 {
            let point = self.random_point_in_polygon(&verts);
            if dist_sqr_xz(point, center) <= radius_sqr {
                return Ok(Some((reference, point)));
            }
        }
        Ok(Some((reference, closest_point_on_polygon(&verts, center))))
    }

    /// Finds the wall nearest to `center` within `radius`, searching the polygons
    /// reachable from `start_ref`.
    ///
    /// An edge is a wall when no polygon passing `filter` lies behind it. Returns
    /// `None` when there is no wall within `radius`.
    pub fn find_distance_to_wall(
        &self,
        start_ref: PolyRef,
        center: Vec3,
        radius: f32,
        filter: &QueryFilter,
    ) -> Result<Option<WallHit>> {
        if !self.nav_mesh.is_valid_poly_ref(start_ref) || radius < 0.0 {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }

        let passable = |reference: PolyRef| {
            self.nav_mesh
                .get_tile_and_poly_by_ref(reference)
                .is_ok_and(|(_, p)| p.poly_type == PolyType::Ground && filter.pass_filter(p))
        };

        let mut best_sqr = radius * radius;
        let mut best_pos = None;
        let mut visited = HashSet::from([start_ref]);
        let mut queue = VecDeque::from([start_ref]);

        while let Some(current) = queue.pop_front() {
            let (tile, poly) = self.nav_mesh.get_tile_and_poly_by_ref(current)?;
            if poly.poly_type != PolyType::Ground {
                continue;
            }
            let verts = tile.poly_verts(poly);
            let poly_index = self.poly_index(current);

            for j in 0..verts.len() {
                let a = verts[j];
                let b = verts[(j + 1) % verts.len()];
                let open = tile
                    .poly_links(poly_index)
                    .any(|l| l.edge_index as usize == j && passable(l.reference));
                if open {
                    continue;
                }
                let (d, t) = dist_point_segment_sqr_xz(center, a, b);
                if d < best_sqr {
                    best_sqr = d;
                    best_pos = Some(a.lerp(b, t));
                }
            }

            for link in tile.poly_links(poly_index) {
                let neighbor = link.reference;
                if visited.contains(&neighbor) || visited.len() >= MAX_NODES || !passable(neighbor) {
                    continue;
                }
                let Some((a, b)) = self.portal_points(current, neighbor) else {
                    continue;
                };
                // Nothing behind this portal can beat the current wall
                if dist_point_segment_sqr_xz(center, a, b).0 > best_sqr {
                    continue;
                }
                visited.insert(neighbor);
                queue.push_back(neighbor);
            }
        }

        Ok(best_pos.map(|position| {
            let mut normal = center - position;
            normal.y = 0.0;
            WallHit {
                distance: best_sqr.sqrt(),
                position,
                normal: normal.normalize_or_zero(),
            }
        }))
    }

    fn random_point_in_polygon(&mut self, verts: &[Vec3]) -> Vec3 {
        if verts.len() < 3 {
            return verts.first().copied().unwrap_or(Vec3::ZERO);
        }
        let areas: Vec<f32> = (1..verts.len() - 1)
            .map(|i| tri_area_xz(verts[0], verts[i], verts[i + 1]).abs() * 0.5)
            .collect();
        let mut threshold = self.random_f32() * areas.iter().sum::<f32>();
        let mut triangle = areas.len() - 1;
        for (k, &area) in areas.iter().enumerate() {
            if threshold <= area {
                triangle = k;
                break;
            }
            threshold -= area;
        }

        let (a, b, c) = (verts[0], verts[triangle + 1], verts[triangle + 2]);
        let s = self.random_f32().sqrt();
        let t = self.random_f32();
        a * (1.0 - s) + b * (s * (1.0 - t)) + c * (s * t)
    }
}

fn broken_path() -> Error {
    Error::Detour(Status::InvalidParam.to_string())
}

/// Adds a path point, merging it into the previous one when both coincide
fn push_point(points: &mut Vec<StraightPathPoint>, position: Vec3, flags: StraightPathFlags, poly: PolyRef) {
    if let Some(last) = points.last_mut() {
        if last.position.distance_squared(position) < EPS {
            if !flags.is_empty() {
                last.flags |= flags;
                last.poly = poly;
            }
            return;
        }
    }
    points.push(StraightPathPoint {
        position,
        flags,
        poly,
    });
}

/// End points of edge `edge` of a ground polygon
fn poly_edge(tile: &MeshTile, poly: &Poly, edge: usize) -> Option<(Vec3, Vec3)> {
    let n = poly.vert_count as usize;
    if edge >= n {
        return None;
    }
    Some((tile.vert(poly.verts[edge]), tile.vert(poly.verts[(edge + 1) % n])))
}

fn cross_xz(u: Vec3, v: Vec3) -> f32 {
    u.x * v.z - u.z * v.x
}

/// Twice the signed area of triangle `abc` on the xz-plane
fn tri_area_xz(a: Vec3, b: Vec3, c: Vec3) -> f32 {
    cross_xz(b - a, c - a)
}

fn same_xz(a: Vec3, b: Vec3) -> bool {
    dist_sqr_xz(a, b) < EPS * EPS
}

fn dist_sqr_xz(a: Vec3, b: Vec3) -> f32 {
    (a.x - b.x).powi(2) + (a.z - b.z).powi(2)
}

fn polygon_area_xz(verts: &[Vec3]) -> f32 {
    (1..verts.len().saturating_sub(1))
        .map(|i| tri_area_xz(verts[0], verts[i], verts[i + 1]).abs() * 0.5)
        .sum()
}

/// Squared xz distance from `p` to segment `ab` and the parameter of the closest point
fn dist_point_segment_sqr_xz(p: Vec3, a: Vec3, b: Vec3) -> (f32, f32) {
    let (dx, dz) = (b.x - a.x, b.z - a.z);
    let len_sqr = dx * dx + dz * dz;
    let t = if len_sqr > 0.0 {
        (((p.x - a.x) * dx + (p.z - a.z) * dz) / len_sqr).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let x = a.x + t * dx - p.x;
    let z = a.z + t * dz - p.z;
    (x * x + z * z, t)
}

/// Clips segment `p0 p1` against a convex polygon on the xz-plane.
///
/// Returns the entry and exit parameters and the edge the segment leaves through,
/// `None` as the edge when `p1` is inside. Works for either winding.
fn intersect_segment_poly_xz(p0: Vec3, p1: Vec3, verts: &[Vec3]) -> Option<(f32, f32, Option<usize>)> {
    let winding = if polygon_signed_area_xz(verts) > 0.0 { -1.0 } else { 1.0 };
    let dir = p1 - p0;
    let mut tmin = 0.0f32;
    let mut tmax = 1.0f32;
    let mut exit_edge = None;

    let n = verts.len();
    let mut j = n - 1;
    for i in 0..n {
        let edge = verts[i] - verts[j];
        let diff = p0 - verts[j];
        let num = winding * (edge.z * diff.x - edge.x * diff.z);
        let den = winding * (dir.z * edge.x - dir.x * edge.z);
        if den.abs() < EPS {
            // Parallel to the edge and outside it
            if num < 0.0 {
                return None;
            }
            j = i;
            continue;
        }
        let t = num / den;
        if den < 0.0 {
            if t > tmin {
                tmin = t;
            }
            if tmin > tmax {
                return None;
            }
        } else {
            if t < tmax {
                tmax = t;
                exit_edge = Some(j);
            }
            if tmax < tmin {
                return None;
            }
        }
        j = i;
    }
    Some((tmin, tmax, exit_edge))
}

fn polygon_signed_area_xz(verts: &[Vec3]) -> f32 {
    let n = verts.len();
    (0..n)
        .map(|i| {
            let (a, b) = (verts[i], verts[(i + 1) % n]);
            a.x * b.z - b.x * a.z
        })
        .sum()
}
