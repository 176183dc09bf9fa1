/// Doubly linked list capability. This abstraction exists so that the list
/// surgery ([`link`] and [`unlink`]) is written once and tested against a
/// plain in-memory list, while the real lists store their head in the heap
/// prologue and their links inside the free blocks themselves (see
/// [`crate::freelist`]). We are the allocator, so there's nowhere else to put
/// them.
///
/// Nodes are small [`Copy`] handles, all the state lives behind the
/// implementor.
pub(crate) trait Chain {
    type Node: Copy + PartialEq;

    unsafe fn head(&self) -> Option<Self::Node>;

    unsafe fn set_head(&mut self, head: Option<Self::Node>);

    unsafe fn pred(&self, node: Self::Node) -> Option<Self::Node>;

    unsafe fn succ(&self, node: Self::Node) -> Option<Self::Node>;

    unsafe fn set_pred(&mut self, node: Self::Node, pred: Option<Self::Node>);

    unsafe fn set_succ(&mut self, node: Self::Node, succ: Option<Self::Node>);
}

/// Links `node` between `pred` and `succ`, which must be adjacent in the
/// chain (`succ` is the successor of `pred`, or the head if `pred` is `None`).
/// There are 4 cases:
///
/// ```text
/// 1. head -> node -> None         (empty chain)
/// 2. head -> node -> succ         (new first node)
/// 3. pred -> node -> None         (new last node)
/// 4. pred -> node -> succ         (somewhere in the middle)
/// ```
///
/// # Safety
///
/// `node` must not currently be part of the chain and all nodes must be
/// valid for the given [`Chain`] implementation.
pub(crate) unsafe fn link<C: Chain>(
    chain: &mut C,
    pred: Option<C::Node>,
    node: C::Node,
    succ: Option<C::Node>,
) {
    match (pred, succ) {
        (None, None) => chain.set_head(Some(node)),
        (None, Some(succ)) => {
            chain.set_head(Some(node));
            chain.set_pred(succ, Some(node));
        }
        (Some(pred), None) => chain.set_succ(pred, Some(node)),
        (Some(pred), Some(succ)) => {
            chain.set_succ(pred, Some(node));
            chain.set_pred(succ, Some(node));
        }
    }

    chain.set_pred(node, pred);
    chain.set_succ(node, succ);
}

/// Removes `node` from the chain, with the same 4 cases as [`link`] depending
/// on whether `node` has a predecessor and/or a successor. The links of
/// `node` itself are left as they were.
///
/// # Safety
///
/// `node` must be part of the chain.
pub(crate) unsafe fn unlink<C: Chain>(chain: &mut C, node: C::Node) {
    let pred = chain.pred(node);
    let succ = chain.succ(node);

    match (pred, succ) {
        (None, None) => chain.set_head(None),
        (None, Some(succ)) => {
            chain.set_head(Some(succ));
            chain.set_pred(succ, None);
        }
        (Some(pred), None) => chain.set_succ(pred, None),
        (Some(pred), Some(succ)) => {
            chain.set_succ(pred, Some(succ));
            chain.set_pred(succ, Some(pred));
        }
    }
}

/// Iterator over the nodes of a chain, head first.
pub(crate) struct Iter<C: Chain> {
    chain: C,
    current: Option<C::Node>,
}

impl<C: Chain> Iter<C> {
    /// # Safety
    ///
    /// The chain must not be modified while iterating.
    pub unsafe fn new(chain: C) -> Self {
        let current = chain.head();
        Self { chain, current }
    }
}

impl<C: Chain> Iterator for Iter<C> {
    type Item = C::Node;

    fn next(&mut self) -> Option<Self::Item> {
        self.current.map(|node| {
            self.current = unsafe { self.chain.succ(node) };
            node
        })
    }
}
