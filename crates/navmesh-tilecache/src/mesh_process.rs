//! Hook for patching polygon data before a tile is added to the navigation mesh

use navmesh_detour::NavMeshCreateParams;

/// Post-processes the polygon data of a tile right before it becomes a navmesh tile.
///
/// Implementations typically assign polygon flags from area ids and append the
/// off-mesh connections that start inside the tile bounds.
pub trait MeshProcess: Send {
    fn process(&mut self, params: &mut NavMeshCreateParams);
}

impl<F> MeshProcess for F
where
    F: FnMut(&mut NavMeshCreateParams) + Send,
{
    fn process(&mut self, params: &mut NavMeshCreateParams) {
        self(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use navmesh_detour::PolyFlags;

    #[test]
    fn test_closure_mesh_process() {
        let mut process = |params: &mut NavMeshCreateParams| {
            params.poly_flags.iter_mut().for_each(|f| *f = PolyFlags::WALK);
        };
        let mut params = NavMeshCreateParams {
            poly_flags: vec![PolyFlags::empty(); 3],
            ..Default::default()
        };
        MeshProcess::process(&mut process, &mut params);
        assert!(params.poly_flags.iter().all(|&f| f == PolyFlags::WALK));
    }
}
