use crate::{
    expr::Expr,
    task_class::TaskClass,
    types::{HashMap, LocalValue, Rank, TaskClassId},
};
use tracing::warn;

/// Answers which rank owns a task instance.
pub trait DataDistribution: Send + Sync {
    fn owning_rank(&self, class: &TaskClass, locals: &[LocalValue]) -> Rank;
}

impl<F> DataDistribution for F
where
    F: Fn(&TaskClass, &[LocalValue]) -> Rank + Send + Sync,
{
    fn owning_rank(&self, class: &TaskClass, locals: &[LocalValue]) -> Rank {
        self(class, locals)
    }
}

/// Everything lives on rank 0.
#[derive(Debug, Copy, Clone, Default)]
pub struct SingleRank;

impl DataDistribution for SingleRank {
    fn owning_rank(&self, _class: &TaskClass, _locals: &[LocalValue]) -> Rank {
        0
    }
}

/// Multi-dimensional cyclic distribution over a process grid.
///
/// An instance with coordinates `c` lives on
/// `Σ_d (c_d mod grid_d) · Π_{e<d} grid_e`. Coordinates are the leading
/// locals of the instance unless the class has its own coordinate
/// expressions.
#[derive(Debug, Clone)]
pub struct CyclicGrid {
    grid: Vec<Rank>,
    coordinates: HashMap<TaskClassId, Vec<Expr>>,
}

impl CyclicGrid {
    /// # Panics
    /// If `grid` is empty or has a zero extent.
    #[must_use]
    pub fn new(grid: Vec<Rank>) -> Self {
        assert!(
            !grid.is_empty() && grid.iter().all(|&extent| extent > 0),
            "CyclicGrid::new: [1]"
        );
        Self {
            grid,
            coordinates: HashMap::default(),
        }
    }

    /// Compute the coordinates of `class` instances with `coordinates`,
    /// one expression per grid dimension.
    #[must_use]
    pub fn with_coordinates(mut self, class: TaskClassId, coordinates: Vec<Expr>) -> Self {
        self.coordinates.insert(class, coordinates);
        self
    }

    #[must_use]
    pub fn nb_ranks(&self) -> Rank {
        self.grid.iter().product()
    }

    fn rank_of(&self, coordinates: impl Iterator<Item = LocalValue>) -> Rank {
        let mut rank = 0;
        let mut stride = 1;
        for (&extent, coordinate) in self.grid.iter().zip(coordinates) {
            let extent_i64 = i64::from(extent);
            let cell = Rank::try_from(i64::from(coordinate).rem_euclid(extent_i64)).expect("CyclicGrid::rank_of: [1]");
            rank += cell * stride;
            stride *= extent;
        }
        rank
    }
}

impl DataDistribution for CyclicGrid {
    fn owning_rank(&self, class: &TaskClass, locals: &[LocalValue]) -> Rank {
        match self.coordinates.get(&class.id()) {
            None => self.rank_of(locals.iter().copied()),
            Some(exprs) => {
                let mut coordinates = Vec::with_capacity(exprs.len());
                for expr in exprs {
                    match expr.eval(locals) {
                        Ok(value) => coordinates.push(value),
                        Err(e) => {
                            warn!(class = class.name(), error = %e, "cannot evaluate coordinate, using rank 0");
                            return 0;
                        }
                    }
                }
                self.rank_of(coordinates.into_iter())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{symbol::Symbol, task_class::TaskClassBuilder};

    #[test]
    fn two_dimensional_cycle() {
        let class = TaskClassBuilder::new("GEMM")
            .local(Symbol::new("m", 0, 9))
            .local(Symbol::new("n", 0, 9))
            .local(Symbol::new("k", 0, 9))
            .build(3)
            .unwrap();
        let grid = CyclicGrid::new(vec![2, 3]);
        assert_eq!(grid.nb_ranks(), 6);
        assert_eq!(grid.owning_rank(&class, &[0, 0, 5]), 0);
        assert_eq!(grid.owning_rank(&class, &[1, 0, 5]), 1);
        assert_eq!(grid.owning_rank(&class, &[0, 1, 5]), 2);
        assert_eq!(grid.owning_rank(&class, &[3, 5, 0]), 1 + 2 * 2);
        assert_eq!(grid.owning_rank(&class, &[-1, 0, 0]), 1);

        let diagonal = grid.with_coordinates(3, vec![Expr::local(2), Expr::local(2)]);
        assert_eq!(diagonal.owning_rank(&class, &[0, 0, 1]), 1 + 2);
    }

    #[test]
    fn closures_distribute() {
        let class = TaskClassBuilder::new("T")
            .local(Symbol::new("i", 0, 9))
            .build(0)
            .unwrap();
        let by_parity = |_: &TaskClass, locals: &[LocalValue]| locals[0].rem_euclid(2) as Rank;
        assert_eq!(by_parity.owning_rank(&class, &[3]), 1);
        assert_eq!(SingleRank.owning_rank(&class, &[3]), 0);
    }
}
