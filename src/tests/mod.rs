mod relay_flow;
