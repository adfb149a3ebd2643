use core::hash::Hash;
use std::collections::HashMap;




/**
 * A minimal directed graph whose edges carry a label. Used to hold the
 * neighbor links of a block hierarchy, where the label is the `Face`
 * describing the relation from the source block's side.
 */
pub struct LabeledGraph<K, L> {
    outgoing: HashMap<K, Vec<(L, K)>>,
}




// ============================================================================
impl<K, L> LabeledGraph<K, L>
where
    K: Hash + Eq + Clone,
    L: Clone + PartialEq,
{


    pub fn new() -> Self {
        Self::default()
    }


    /**
     * Return the number of edges in the graph.
     */
    pub fn len(&self) -> usize {
        self.outgoing.iter().map(|(_, edges)| edges.len()).sum()
    }


    /**
     * Determine whether there are any edges in the graph.
     */
    pub fn is_empty(&self) -> bool {
        self.outgoing.iter().all(|(_, edges)| edges.is_empty())
    }


    /**
     * Insert an edge a -> b with the given label.
     */
    pub fn insert(&mut self, a: K, label: L, b: K) {
        self.outgoing.entry(a).or_default().push((label, b))
    }


    /**
     * Determine whether an edge a -> b exists under any label.
     */
    pub fn contains(&self, a: &K, b: &K) -> bool {
        self.outgoing
            .get(a)
            .map(|edges| edges.iter().any(|(_, k)| k == b))
            .unwrap_or(false)
    }


    /**
     * Return an iterator over the labeled edges emanating from the given
     * vertex.
     */
    pub fn edges(&self, a: &K) -> impl Iterator<Item = &(L, K)> {
        self.outgoing.get(a).into_iter().flat_map(|edges| edges.iter())
    }


    /**
     * Return the out-degree of the given vertex.
     */
    pub fn degree(&self, a: &K) -> usize {
        self.outgoing.get(a).map(|edges| edges.len()).unwrap_or(0)
    }
}

impl<K, L> Default for LabeledGraph<K, L> {
    fn default() -> Self {
        Self {
            outgoing: HashMap::new(),
        }
    }
}
